//! Instance bootstrap contract.
//!
//! On first boot the instance downloads the bootstrap artifact from the template store,
//! verifies its checksum, and executes it with [ARGUMENTS]. The exit status is written to
//! [EXIT_STATUS_PATH], signalled to [SIGNAL_RESOURCE] of the stack with `cfn-signal`, and
//! becomes the exit status of the user-data script itself.
//!
//! The signal is read back from the stack events ([parse_signal]) and handed to a
//! [Reporter]; the matching [Completion] resolves once the status is known.

use crate::{template::TemplateReference, Error};
use futures::channel::oneshot;
use std::{fmt, str::FromStr};

/// Fixed arguments the bootstrap artifact is executed with.
pub const ARGUMENTS: &[&str] = &["--verbose", "-y"];

/// Directory the artifact is downloaded to.
pub const BOOTSTRAP_DIR: &str = "/opt/launcher";

/// File the exit status of the artifact is written to.
pub const EXIT_STATUS_PATH: &str = "/opt/launcher/bootstrap.exit";

/// Logical id of the template resource whose creation policy waits for the bootstrap signal.
pub const SIGNAL_RESOURCE: &str = "Instance";

/// Location of the signal helper on the instance image.
const CFN_SIGNAL: &str = "/opt/aws/bin/cfn-signal";

/// Stack event reason of a successful signal.
const SUCCESS_SIGNAL: &str = "Received SUCCESS signal";

/// Stack event reason of a failed signal.
const FAILURE_SIGNAL: &str = "Received FAILURE signal";

/// Exit status of the bootstrap artifact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Exit(pub i32);

impl Exit {
    pub fn success(&self) -> bool {
        self.0 == 0
    }
}

impl FromStr for Exit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse()
            .map(Exit)
            .map_err(|_| Error::Template(format!("invalid exit status: {s:?}")))
    }
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit status {}", self.0)
    }
}

/// Extracts the exit status carried by a signal event of [SIGNAL_RESOURCE].
///
/// Signals are sent with the reason `exit status <N>`. If the backend does not echo the
/// reason, a failure signal is reported as exit status 1.
pub fn parse_signal(reason: &str) -> Option<Exit> {
    let success = if reason.contains(SUCCESS_SIGNAL) {
        true
    } else if reason.contains(FAILURE_SIGNAL) {
        false
    } else {
        return None;
    };
    let reported = reason
        .split_once("exit status ")
        .and_then(|(_, rest)| {
            let digits = rest
                .split(|c: char| !c.is_ascii_digit())
                .next()
                .unwrap_or_default();
            digits.parse().ok()
        })
        .map(Exit);
    Some(match (success, reported) {
        (_, Some(exit)) => exit,
        (true, None) => Exit(0),
        (false, None) => Exit(1),
    })
}

/// Renders the commands that fetch and run the bootstrap artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bootstrap {
    source: String,
    file_name: String,
    checksum: String,
}

impl Bootstrap {
    /// Creates a bootstrap for an artifact published at an `s3://` location.
    pub fn new(artifact: &TemplateReference) -> Result<Self, Error> {
        let key = artifact
            .location
            .strip_prefix("s3://")
            .and_then(|rest| rest.split_once('/'))
            .filter(|(bucket, key)| !bucket.is_empty() && !key.is_empty())
            .map(|(_, key)| key)
            .ok_or_else(|| {
                Error::Template(format!(
                    "bootstrap artifact must be an s3:// location: {}",
                    artifact.location
                ))
            })?;
        let file_name = key.rsplit('/').next().unwrap_or(key).to_string();
        let safe = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');

        // The location is interpolated into a shell script
        if file_name.is_empty()
            || !file_name.chars().all(safe)
            || !artifact.location.chars().all(|c| safe(c) || matches!(c, '/' | ':'))
        {
            return Err(Error::Template(format!(
                "invalid bootstrap artifact name: {file_name:?}"
            )));
        }
        if artifact.checksum.len() != 64 || !artifact.checksum.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(Error::Template(format!(
                "invalid bootstrap checksum: {:?}",
                artifact.checksum
            )));
        }
        Ok(Self {
            source: artifact.location.clone(),
            file_name,
            checksum: artifact.checksum.to_ascii_lowercase(),
        })
    }

    /// Path the artifact is executed from.
    pub fn local_path(&self) -> String {
        format!("{BOOTSTRAP_DIR}/{}", self.file_name)
    }

    /// Command line the artifact is executed with.
    pub fn command(&self) -> String {
        let mut command = self.local_path();
        for argument in ARGUMENTS {
            command.push(' ');
            command.push_str(argument);
        }
        command
    }

    /// Renders the instance user-data script.
    ///
    /// The script is meant to be embedded with `Fn::Sub`, which fills in the stack name and
    /// region the exit status is signalled to.
    pub fn user_data(&self) -> String {
        let local_path = self.local_path();
        format!(
            r#"#!/bin/bash
set -u
mkdir -p {BOOTSTRAP_DIR}

# Record and signal the bootstrap status, then exit with it
finish() {{
  echo "$1" > {EXIT_STATUS_PATH}
  {CFN_SIGNAL} -e "$1" --reason "exit status $1" --stack "${{AWS::StackName}}" --resource {SIGNAL_RESOURCE} --region "${{AWS::Region}}"
  exit "$1"
}}

# Download bootstrap artifact with retries
for i in {{1..5}}; do
  aws s3 cp {source} {local_path} && break
  sleep 10
done

# Verify and run
echo "{checksum}  {local_path}" | sha256sum -c - || finish 127
chmod +x {local_path}
{command}
finish $?
"#,
            source = self.source,
            checksum = self.checksum,
            command = self.command(),
        )
    }
}

/// Reports the exit status of the bootstrap artifact.
#[derive(Debug)]
pub struct Reporter {
    sender: oneshot::Sender<Exit>,
}

impl Reporter {
    /// Reports the exit status. Returns false if nobody is waiting for it.
    pub fn report(self, exit: Exit) -> bool {
        self.sender.send(exit).is_ok()
    }
}

/// Resolves to the reported exit status.
#[derive(Debug)]
pub struct Completion {
    receiver: oneshot::Receiver<Exit>,
}

impl Completion {
    /// Waits for the exit status, returning `None` if the [Reporter] was dropped.
    pub async fn wait(self) -> Option<Exit> {
        self.receiver.await.ok()
    }
}

/// Creates a completion signal channel.
pub fn channel() -> (Reporter, Completion) {
    let (sender, receiver) = oneshot::channel();
    (Reporter { sender }, Completion { receiver })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECKSUM: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn artifact(location: &str) -> TemplateReference {
        TemplateReference {
            location: location.to_string(),
            checksum: CHECKSUM.to_string(),
        }
    }

    #[test]
    fn test_user_data() {
        let bootstrap =
            Bootstrap::new(&artifact("s3://launcher-artifacts/templates/abc/setup.sh")).unwrap();
        assert_eq!(bootstrap.command(), "/opt/launcher/setup.sh --verbose -y");

        let script = bootstrap.user_data();
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains(
            "aws s3 cp s3://launcher-artifacts/templates/abc/setup.sh /opt/launcher/setup.sh"
        ));
        assert!(script.contains(&format!("echo \"{CHECKSUM}  /opt/launcher/setup.sh\"")));
        assert!(script.contains("chmod +x /opt/launcher/setup.sh\n"));
        assert!(script.contains("\n/opt/launcher/setup.sh --verbose -y\n"));
        assert!(script.ends_with("\n/opt/launcher/setup.sh --verbose -y\nfinish $?\n"));

        // Executed only after it is made executable
        let chmod = script.find("chmod +x").unwrap();
        let run = script.find("setup.sh --verbose").unwrap();
        assert!(chmod < run);
    }

    #[test]
    fn test_user_data_exit_path() {
        let bootstrap =
            Bootstrap::new(&artifact("s3://launcher-artifacts/templates/abc/setup.sh")).unwrap();
        let script = bootstrap.user_data();

        // Every exit goes through finish, which signals the status and propagates it
        assert!(script.contains("echo \"$1\" > /opt/launcher/bootstrap.exit\n"));
        assert!(script.contains(
            "/opt/aws/bin/cfn-signal -e \"$1\" --reason \"exit status $1\" \
             --stack \"${AWS::StackName}\" --resource Instance --region \"${AWS::Region}\"\n"
        ));
        assert!(script.contains("  exit \"$1\"\n}"));
        assert!(script.contains("sha256sum -c - || finish 127\n"));
        assert!(!script.contains("exit 1"));
        let signal = script.find("cfn-signal").unwrap();
        let exit = script.find("exit \"$1\"").unwrap();
        assert!(signal < exit);

        // No shell expansion collides with Fn::Sub other than the stack pseudo parameters
        let substitutions: Vec<_> = script.match_indices("${").map(|(i, _)| &script[i..]).collect();
        assert_eq!(substitutions.len(), 2);
        assert!(substitutions[0].starts_with("${AWS::StackName}"));
        assert!(substitutions[1].starts_with("${AWS::Region}"));
    }

    #[test]
    fn test_parse_signal() {
        assert_eq!(
            parse_signal("Received SUCCESS signal with UniqueId i-0abc"),
            Some(Exit(0))
        );
        assert_eq!(
            parse_signal("Received FAILURE signal with UniqueId i-0abc: exit status 3"),
            Some(Exit(3))
        );
        assert_eq!(
            parse_signal("Received FAILURE signal with UniqueId i-0abc"),
            Some(Exit(1))
        );
        assert_eq!(parse_signal("Resource creation Initiated"), None);
    }

    #[test]
    fn test_rejects_locations() {
        for location in [
            "https://example.com/setup.sh",
            "s3://bucket",
            "s3:///setup.sh",
            "s3://bucket/",
            "s3://bucket/dir/set up.sh",
            "s3://bucket/$(reboot)",
        ] {
            assert!(Bootstrap::new(&artifact(location)).is_err(), "{location}");
        }

        let mut bad = artifact("s3://bucket/setup.sh");
        bad.checksum = "abc".into();
        assert!(Bootstrap::new(&bad).is_err());
    }

    #[test]
    fn test_exit_parse() {
        assert_eq!("0\n".parse::<Exit>().unwrap(), Exit(0));
        assert!(!"3".parse::<Exit>().unwrap().success());
        assert!("ok".parse::<Exit>().is_err());
    }

    #[tokio::test]
    async fn test_channel() {
        let (reporter, completion) = channel();
        let handle = tokio::spawn(completion.wait());
        assert!(reporter.report(Exit(0)));
        assert_eq!(handle.await.unwrap(), Some(Exit(0)));

        let (reporter, completion) = channel();
        drop(reporter);
        assert_eq!(completion.wait().await, None);

        let (reporter, completion) = channel();
        drop(completion);
        assert!(!reporter.report(Exit(1)));
    }
}
