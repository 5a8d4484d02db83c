//! In-memory deployment backend with scripted native status sequences.

use crate::{
    backend::{self, Error, Operation, StackSpec, StackState, StackSummary},
    bootstrap::Exit,
};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

/// Native statuses of failed stacks that must be deleted before they can be reused.
const UNRECOVERABLE: &[&str] = &[
    "CREATE_FAILED",
    "ROLLBACK_COMPLETE",
    "ROLLBACK_FAILED",
    "DELETE_FAILED",
    "UPDATE_ROLLBACK_FAILED",
];

/// Number of calls issued per operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Calls {
    pub create: usize,
    pub update: usize,
    pub describe: usize,
    pub cancel_update: usize,
    pub delete: usize,
    pub list: usize,
    pub events: usize,
}

/// Next observable change of a stack.
#[derive(Clone, Debug)]
enum Step {
    Status(String),
    Remove,
}

/// A scripted native status sequence: the stack starts in `steps[0]` and settles in `last`.
#[derive(Clone, Debug)]
struct Script {
    steps: Vec<String>,
    last: String,
}

impl Script {
    fn new(steps: &[&str], last: &str) -> Self {
        Self {
            steps: steps.iter().map(|s| s.to_string()).collect(),
            last: last.to_string(),
        }
    }

    /// Returns the initial status and the steps that follow it.
    fn start(&self) -> (String, VecDeque<Step>) {
        let mut statuses = self.steps.iter().chain(std::iter::once(&self.last));
        let first = statuses.next().cloned().unwrap_or_else(|| self.last.clone());
        let rest = statuses.map(|s| Step::Status(s.clone())).collect();
        (first, rest)
    }
}

struct Stack {
    id: String,
    spec: StackSpec,
    previous: Option<StackSpec>,
    status: String,
    pending: VecDeque<Step>,
}

impl Stack {
    fn busy(&self) -> bool {
        self.status.ends_with("_IN_PROGRESS")
    }

    fn run(&mut self, script: &Script) {
        let (status, pending) = script.start();
        self.status = status;
        self.pending = pending;
    }
}

struct State {
    stacks: BTreeMap<String, Stack>,
    next_id: u64,
    calls: Calls,
    failures: HashMap<Operation, VecDeque<Error>>,
    create_script: Script,
    update_script: Script,
    failing_deletes: bool,
    describe_latency: Duration,
    signals: HashMap<String, Exit>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            stacks: BTreeMap::new(),
            next_id: 0,
            calls: Calls::default(),
            failures: HashMap::new(),
            create_script: Script::new(&["CREATE_IN_PROGRESS"], "CREATE_COMPLETE"),
            update_script: Script::new(
                &["UPDATE_IN_PROGRESS", "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS"],
                "UPDATE_COMPLETE",
            ),
            failing_deletes: false,
            describe_latency: Duration::ZERO,
            signals: HashMap::new(),
        }
    }
}

impl State {
    fn injected(&mut self, operation: Operation) -> Result<(), Error> {
        match self.failures.get_mut(&operation).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// A deployment backend that keeps stacks in memory.
///
/// Each describe reports the current native status of a stack and then advances it one step
/// along its script. Clones share state.
#[derive(Clone, Default)]
pub struct Backend {
    state: Arc<Mutex<State>>,
}

impl Backend {
    /// Sets the status sequence of subsequently created stacks.
    pub fn script_create(&self, steps: &[&str], last: &str) {
        self.state.lock().unwrap().create_script = Script::new(steps, last);
    }

    /// Sets the status sequence of subsequent updates.
    pub fn script_update(&self, steps: &[&str], last: &str) {
        self.state.lock().unwrap().update_script = Script::new(steps, last);
    }

    /// Fails the next call of `operation` with `error`.
    pub fn fail_next(&self, operation: Operation, error: Error) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Makes subsequent deletions end in `DELETE_FAILED` instead of removing the stack.
    pub fn fail_deletes(&self) {
        self.state.lock().unwrap().failing_deletes = true;
    }

    /// Delays every describe by `latency`.
    pub fn set_describe_latency(&self, latency: Duration) {
        self.state.lock().unwrap().describe_latency = latency;
    }

    /// Records the exit status the bootstrap of a stack signalled.
    pub fn signal(&self, name: &str, exit: Exit) {
        self.state
            .lock()
            .unwrap()
            .signals
            .insert(name.to_string(), exit);
    }

    /// Returns the calls issued so far.
    pub fn calls(&self) -> Calls {
        self.state.lock().unwrap().calls
    }

    /// Returns the number of stacks that exist.
    pub fn stacks(&self) -> usize {
        self.state.lock().unwrap().stacks.len()
    }

    /// Returns the specification a stack was last submitted with.
    pub fn spec(&self, name: &str) -> Option<StackSpec> {
        self.state
            .lock()
            .unwrap()
            .stacks
            .get(name)
            .map(|stack| stack.spec.clone())
    }

    /// Returns the current native status of a stack (without advancing it).
    pub fn status(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .stacks
            .get(name)
            .map(|stack| stack.status.clone())
    }
}

impl backend::Backend for Backend {
    async fn create_stack(&self, spec: &StackSpec) -> Result<String, Error> {
        let mut state = self.state.lock().unwrap();
        state.calls.create += 1;
        state.injected(Operation::Create)?;
        if state.stacks.contains_key(&spec.name) {
            return Err(Error::AlreadyExists);
        }
        state.next_id += 1;
        let id = format!("{}/{}", spec.name, state.next_id);
        let (status, pending) = state.create_script.start();
        state.stacks.insert(
            spec.name.clone(),
            Stack {
                id: id.clone(),
                spec: spec.clone(),
                previous: None,
                status,
                pending,
            },
        );
        Ok(id)
    }

    async fn update_stack(&self, spec: &StackSpec) -> Result<String, Error> {
        let mut state = self.state.lock().unwrap();
        state.calls.update += 1;
        state.injected(Operation::Update)?;
        let script = state.update_script.clone();
        let stack = state
            .stacks
            .get_mut(&spec.name)
            .ok_or_else(|| Error::NotFound(spec.name.clone()))?;
        if UNRECOVERABLE.contains(&stack.status.as_str()) {
            return Err(Error::Unrecoverable(format!(
                "stack is in {} state and can not be updated",
                stack.status
            )));
        }
        if stack.busy() {
            return Err(Error::Busy(format!(
                "stack is in {} state and can not be updated",
                stack.status
            )));
        }
        if stack.spec == *spec {
            return Err(Error::NoChanges);
        }
        stack.previous = Some(std::mem::replace(&mut stack.spec, spec.clone()));
        stack.run(&script);
        Ok(stack.id.clone())
    }

    async fn describe_stack(&self, name: &str) -> Result<Option<StackState>, Error> {
        let latency = self.state.lock().unwrap().describe_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock().unwrap();
        state.calls.describe += 1;
        state.injected(Operation::Describe)?;
        let Some(stack) = state.stacks.get_mut(name) else {
            return Ok(None);
        };
        let observed = StackState {
            id: stack.id.clone(),
            status: stack.status.clone(),
            reason: match stack.status.as_str() {
                "DELETE_FAILED" => Some(format!("resource deletion failed for {name}")),
                status if status.ends_with("_FAILED") => {
                    Some(format!("resource creation failed for {name}"))
                }
                _ => None,
            },
        };
        match stack.pending.pop_front() {
            Some(Step::Status(status)) => stack.status = status,
            Some(Step::Remove) => {
                state.stacks.remove(name);
            }
            None => {}
        }
        Ok(Some(observed))
    }

    async fn cancel_update(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.calls.cancel_update += 1;
        state.injected(Operation::CancelUpdate)?;
        let stack = state
            .stacks
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        if stack.status != "UPDATE_IN_PROGRESS" {
            return Err(Error::Failure {
                code: "ValidationError".into(),
                message: format!(
                    "CancelUpdateStack cannot be called from current stack status {}",
                    stack.status
                ),
            });
        }
        if let Some(previous) = stack.previous.take() {
            stack.spec = previous;
        }
        stack.run(&Script::new(
            &[
                "UPDATE_ROLLBACK_IN_PROGRESS",
                "UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS",
            ],
            "UPDATE_ROLLBACK_COMPLETE",
        ));
        Ok(())
    }

    async fn delete_stack(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.calls.delete += 1;
        state.injected(Operation::Delete)?;

        // Deleting a missing stack succeeds
        let last = if state.failing_deletes {
            Step::Status("DELETE_FAILED".to_string())
        } else {
            Step::Remove
        };
        if let Some(stack) = state.stacks.get_mut(name) {
            stack.status = "DELETE_IN_PROGRESS".to_string();
            stack.pending = VecDeque::from([last]);
        }
        Ok(())
    }

    async fn bootstrap_exit(&self, name: &str) -> Result<Option<Exit>, Error> {
        let mut state = self.state.lock().unwrap();
        state.calls.events += 1;
        state.injected(Operation::Events)?;
        if !state.stacks.contains_key(name) {
            return Err(Error::NotFound(name.to_string()));
        }
        Ok(state.signals.get(name).copied())
    }

    async fn list_stacks(&self, prefix: &str) -> Result<Vec<StackSummary>, Error> {
        let mut state = self.state.lock().unwrap();
        state.calls.list += 1;
        state.injected(Operation::List)?;
        Ok(state
            .stacks
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, stack)| StackSummary {
                name: name.clone(),
                id: stack.id.clone(),
                status: stack.status.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend as _;

    fn spec(name: &str, cidr: &str) -> StackSpec {
        StackSpec {
            name: name.to_string(),
            template_url: "https://example.com/t.yaml".into(),
            parameters: vec![("InboundCidrParam".into(), cidr.into())],
            tags: BTreeMap::new(),
        }
    }

    async fn statuses(backend: &Backend, name: &str, n: usize) -> Vec<Option<String>> {
        let mut observed = Vec::new();
        for _ in 0..n {
            observed.push(
                backend
                    .describe_stack(name)
                    .await
                    .unwrap()
                    .map(|state| state.status),
            );
        }
        observed
    }

    #[tokio::test]
    async fn test_create_script() {
        let backend = Backend::default();
        backend.create_stack(&spec("a", "10.0.0.0/8")).await.unwrap();
        assert_eq!(
            statuses(&backend, "a", 3).await,
            vec![
                Some("CREATE_IN_PROGRESS".to_string()),
                Some("CREATE_COMPLETE".to_string()),
                Some("CREATE_COMPLETE".to_string()),
            ]
        );
        assert_eq!(
            backend.create_stack(&spec("a", "10.0.0.0/8")).await,
            Err(Error::AlreadyExists)
        );
    }

    #[tokio::test]
    async fn test_update() {
        let backend = Backend::default();
        backend.create_stack(&spec("a", "10.0.0.0/8")).await.unwrap();
        assert!(matches!(
            backend.update_stack(&spec("a", "10.0.0.0/8")).await,
            Err(Error::Busy(_))
        ));
        statuses(&backend, "a", 2).await;
        assert_eq!(
            backend.update_stack(&spec("a", "10.0.0.0/8")).await,
            Err(Error::NoChanges)
        );
        backend.update_stack(&spec("a", "10.0.0.0/16")).await.unwrap();
        assert_eq!(
            statuses(&backend, "a", 3).await.last().unwrap().as_deref(),
            Some("UPDATE_COMPLETE")
        );
        assert!(matches!(
            backend.update_stack(&spec("b", "10.0.0.0/8")).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_update_restores_spec() {
        let backend = Backend::default();
        backend.create_stack(&spec("a", "10.0.0.0/8")).await.unwrap();
        statuses(&backend, "a", 2).await;
        backend.update_stack(&spec("a", "10.0.0.0/16")).await.unwrap();
        backend.cancel_update("a").await.unwrap();
        assert_eq!(backend.spec("a"), Some(spec("a", "10.0.0.0/8")));
        assert_eq!(
            statuses(&backend, "a", 3).await.last().unwrap().as_deref(),
            Some("UPDATE_ROLLBACK_COMPLETE")
        );
        assert!(backend.cancel_update("a").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let backend = Backend::default();
        backend.create_stack(&spec("x-a", "10.0.0.0/8")).await.unwrap();
        backend.create_stack(&spec("y-b", "10.0.0.0/8")).await.unwrap();
        assert_eq!(backend.list_stacks("x-").await.unwrap().len(), 1);

        backend.delete_stack("x-a").await.unwrap();
        assert_eq!(
            statuses(&backend, "x-a", 2).await,
            vec![Some("DELETE_IN_PROGRESS".to_string()), None]
        );
        assert_eq!(backend.stacks(), 1);
        backend.delete_stack("missing").await.unwrap();
        assert_eq!(backend.calls().delete, 2);
    }

    #[tokio::test]
    async fn test_failing_delete() {
        let backend = Backend::default();
        backend.create_stack(&spec("a", "10.0.0.0/8")).await.unwrap();
        backend.fail_deletes();
        backend.delete_stack("a").await.unwrap();
        assert_eq!(
            statuses(&backend, "a", 3).await,
            vec![
                Some("DELETE_IN_PROGRESS".to_string()),
                Some("DELETE_FAILED".to_string()),
                Some("DELETE_FAILED".to_string()),
            ]
        );
        let state = backend.describe_stack("a").await.unwrap().unwrap();
        assert_eq!(state.reason.as_deref(), Some("resource deletion failed for a"));
        assert!(matches!(
            backend.update_stack(&spec("a", "10.0.0.0/16")).await,
            Err(Error::Unrecoverable(_))
        ));
    }

    #[tokio::test]
    async fn test_signals() {
        let backend = Backend::default();
        assert!(matches!(
            backend.bootstrap_exit("a").await,
            Err(Error::NotFound(_))
        ));
        backend.create_stack(&spec("a", "10.0.0.0/8")).await.unwrap();
        assert_eq!(backend.bootstrap_exit("a").await, Ok(None));
        backend.signal("a", Exit(2));
        assert_eq!(backend.bootstrap_exit("a").await, Ok(Some(Exit(2))));
        assert_eq!(backend.calls().events, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_describe_latency() {
        let backend = Backend::default();
        backend.create_stack(&spec("a", "10.0.0.0/8")).await.unwrap();
        backend.set_describe_latency(Duration::from_secs(30));
        let start = tokio::time::Instant::now();
        backend.describe_stack("a").await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_fail_next() {
        let backend = Backend::default();
        backend.fail_next(Operation::Create, Error::Busy("throttled".into()));
        assert_eq!(
            backend.create_stack(&spec("a", "10.0.0.0/8")).await,
            Err(Error::Busy("throttled".into()))
        );
        backend.create_stack(&spec("a", "10.0.0.0/8")).await.unwrap();
        assert_eq!(backend.calls().create, 2);
    }
}
