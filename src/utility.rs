//! Host bound utilities.
//!
//! A utility is a helper that changes something on a host (writes files,
//! changes the hostname, starts services) and knows how to revert it. Roles
//! own utilities for the duration of one test; hosts own *reentrant*
//! utilities that live for the whole session and are entered and exited
//! around every topology and every test.
//!
//! # Lifecycle
//!
//! ```text
//! setup_utility ──► enter_utility(where) ──► ... ──► exit_utility(where) ──► teardown_utility
//! ```
//!
//! Utilities created with [`UtilityState::postpone_setup`] are not set up
//! until first used. Every public operation of such a utility must start
//! with [`mark_used`], which runs the postponed setup and replays the enter
//! that was skipped while the utility was unused.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::artifacts::ArtifactsType;
use crate::error::{AggregateKind, Error, ErrorCollector, Result};
use crate::inventory::MultihostHost;
use crate::logging::MultihostLogger;

/// Where a utility is entered by [`setup_utilities`].
pub const WHERE_DEPENDENCIES: &str = "mh_utility_dependencies";

/// Where a utility is entered by [`with_utility`].
pub const WHERE_SCOPED: &str = "mh_utility";

// ============================================================================
// Operation status
// ============================================================================

/// Named states of operations such as `setup` or `topology_setup`.
#[derive(Debug, Default)]
pub struct OperationStatus {
    states: Mutex<HashMap<String, String>>,
}

impl OperationStatus {
    /// Creates an empty status.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the state of `op`.
    pub fn set(&self, op: &str, status: &str) {
        self.states.lock().insert(op.to_string(), status.to_string());
    }

    /// Marks `op` as successful.
    pub fn set_success(&self, op: &str) {
        self.set(op, "success");
    }

    /// Marks `op` as failed.
    pub fn set_failure(&self, op: &str) {
        self.set(op, "failure");
    }

    /// State of `op`.
    pub fn get(&self, op: &str) -> Option<String> {
        self.states.lock().get(op).cloned()
    }

    /// True if `op` is in `status`.
    pub fn check(&self, op: &str, status: &str) -> bool {
        self.states.lock().get(op).is_some_and(|s| s == status)
    }

    /// True if `op` succeeded.
    pub fn check_success(&self, op: &str) -> bool {
        self.check(op, "success")
    }

    /// Forgets the state of `op`.
    pub fn clear(&self, op: &str) {
        self.states.lock().remove(op);
    }
}

// ============================================================================
// Utility state and trait
// ============================================================================

/// Bookkeeping shared by every utility.
pub struct UtilityState {
    name: String,
    postpone_setup: bool,
    reentrant: bool,
    used: AtomicBool,
    op_state: OperationStatus,
    enter_stack: Mutex<Vec<(String, bool)>>,
    artifacts: Mutex<BTreeSet<String>>,
    logger: MultihostLogger,
}

impl UtilityState {
    /// Creates the state of a utility called `name`.
    ///
    /// The name orders utilities without mutual dependencies.
    pub fn new(name: impl Into<String>, logger: MultihostLogger) -> Self {
        Self {
            name: name.into(),
            postpone_setup: false,
            reentrant: false,
            used: AtomicBool::new(false),
            op_state: OperationStatus::new(),
            enter_stack: Mutex::new(Vec::new()),
            artifacts: Mutex::new(BTreeSet::new()),
            logger,
        }
    }

    /// Setup is postponed until the utility is first used.
    pub fn postpone_setup(mut self) -> Self {
        self.postpone_setup = true;
        self
    }

    /// The utility can be entered and exited repeatedly.
    pub fn reentrant(mut self) -> Self {
        self.reentrant = true;
        self
    }

    /// Utility name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if setup is postponed until first use.
    pub fn is_postponed(&self) -> bool {
        self.postpone_setup
    }

    /// True for reentrant utilities.
    pub fn is_reentrant(&self) -> bool {
        self.reentrant
    }

    /// True once the utility was used.
    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::SeqCst)
    }

    /// Operation states (`setup`, `__enter__{where}`).
    pub fn op_state(&self) -> &OperationStatus {
        &self.op_state
    }

    /// Logger.
    pub fn logger(&self) -> &MultihostLogger {
        &self.logger
    }

    /// Adds an artifact collected after the test.
    pub fn add_artifact(&self, path: impl Into<String>) {
        self.artifacts.lock().insert(path.into());
    }

    /// Artifacts added so far.
    pub fn artifacts(&self) -> BTreeSet<String> {
        self.artifacts.lock().clone()
    }

    /// Number of open enter records.
    pub fn depth(&self) -> usize {
        self.enter_stack.lock().len()
    }
}

impl fmt::Debug for UtilityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UtilityState")
            .field("name", &self.name)
            .field("postpone_setup", &self.postpone_setup)
            .field("reentrant", &self.reentrant)
            .field("used", &self.is_used())
            .finish_non_exhaustive()
    }
}

/// A helper bound to one host.
///
/// Only [`Utility::state`] and [`Utility::as_any`] are required; every hook
/// defaults to doing nothing.
#[async_trait]
pub trait Utility: Send + Sync + fmt::Debug {
    /// Shared bookkeeping.
    fn state(&self) -> &UtilityState;

    /// Utilities this utility uses; they are set up before it and torn down
    /// after it.
    fn dependencies(&self) -> Vec<Arc<dyn Utility>> {
        Vec::new()
    }

    /// Prepares the utility.
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    /// Reverts everything the utility did.
    async fn teardown(&self) -> Result<()> {
        Ok(())
    }

    /// Runs before [`Utility::teardown`] if the utility was used.
    async fn teardown_when_used(&self) -> Result<()> {
        Ok(())
    }

    /// Saves the current state and starts a new context (reentrant only).
    async fn enter(&self) -> Result<()> {
        Ok(())
    }

    /// Restores the state saved by the matching enter (reentrant only).
    async fn exit(&self) -> Result<()> {
        Ok(())
    }

    /// Artifacts to collect from `host`.
    fn artifacts_list(&self, host: &dyn MultihostHost, kind: ArtifactsType) -> Result<BTreeSet<String>> {
        let _ = (host, kind);
        Ok(self.state().artifacts())
    }

    /// Returns this as Any for downcasting.
    fn as_any(&self) -> &dyn Any;
}

// ============================================================================
// Lifecycle operations
// ============================================================================

/// Records a use of `util`.
///
/// On the first use of a postponed utility its setup runs and, for reentrant
/// utilities, the enter skipped while it was unused is replayed.
pub async fn mark_used(util: &dyn Utility) -> Result<()> {
    let state = util.state();
    let first_use = !state.used.swap(true, Ordering::SeqCst);
    if !state.postpone_setup || !first_use {
        return Ok(());
    }

    state.logger.debug(format!("Utility {} used for the first time, running setup", state.name));
    setup_utility(util).await?;

    if state.reentrant {
        let skipped = state.enter_stack.lock().pop();
        if let Some((place, _)) = skipped {
            enter_utility(util, &place).await?;
        }
    }

    Ok(())
}

/// Runs setup unless it is postponed and the utility is unused.
pub async fn setup_utility(util: &dyn Utility) -> Result<()> {
    let state = util.state();
    if state.postpone_setup && !state.is_used() {
        return Ok(());
    }

    match util.setup().await {
        Ok(()) => {
            state.op_state.set_success("setup");
            Ok(())
        }
        Err(e) => {
            state.op_state.set_failure("setup");
            Err(e)
        }
    }
}

/// Runs teardown if setup ran and succeeded.
///
/// [`Utility::teardown_when_used`] runs first if the utility was used.
pub async fn teardown_utility(util: &dyn Utility) -> Result<()> {
    let state = util.state();
    if state.postpone_setup && !state.is_used() {
        return Ok(());
    }

    if !state.op_state.check_success("setup") {
        return Ok(());
    }

    let mut errors = ErrorCollector::new();
    if state.is_used() {
        errors.record(util.teardown_when_used().await);
    }
    errors.record(util.teardown().await);
    state.op_state.clear("setup");
    errors.finish_flat()
}

/// Enters a reentrant utility at `place`; other utilities are ignored.
///
/// A postponed utility that is unused records the enter without running it.
pub async fn enter_utility(util: &dyn Utility, place: &str) -> Result<()> {
    let state = util.state();
    if !state.reentrant {
        return Ok(());
    }

    if state.postpone_setup && !state.is_used() {
        state.enter_stack.lock().push((place.to_string(), false));
        return Ok(());
    }

    if !state.op_state.check_success("setup") {
        return Err(Error::Utility(format!(
            "Trying to enter {} without successful setup",
            state.name
        )));
    }

    match util.enter().await {
        Ok(()) => {
            state.enter_stack.lock().push((place.to_string(), true));
            Ok(())
        }
        Err(e) => {
            state.enter_stack.lock().push((place.to_string(), false));
            Err(e)
        }
    }
}

/// Exits a reentrant utility entered at `place`.
///
/// Fails if there is no open enter or the innermost one was made elsewhere.
/// The exit hook runs only if the matching enter ran.
pub async fn exit_utility(util: &dyn Utility, place: &str) -> Result<()> {
    let state = util.state();
    if !state.reentrant {
        return Ok(());
    }

    let entry = state.enter_stack.lock().pop();
    let (entered_at, entered) = match entry {
        Some(entry) => entry,
        // A failed setup never pushes an enter record.
        None if !state.op_state.check_success("setup") => return Ok(()),
        None => {
            return Err(Error::Lookup(format!(
                "Calling exit on {} but enter was not called",
                state.name
            )))
        }
    };

    if entered_at != place {
        return Err(Error::Lookup(format!(
            "Calling exit on {} from unexpected place {place}, expected {entered_at}",
            state.name
        )));
    }

    if !entered || !state.op_state.check_success("setup") {
        return Ok(());
    }

    util.exit().await
}

/// Orders `utilities` and everything they depend on.
///
/// Utilities without dependencies come first, sorted by name; then, in
/// rounds, every utility whose dependencies are all placed, sorted by name.
/// Each utility appears once.
pub fn resolve_dependencies(utilities: &[Arc<dyn Utility>]) -> Result<Vec<Arc<dyn Utility>>> {
    let mut pending: Vec<Arc<dyn Utility>> = Vec::new();
    let mut stack: Vec<Arc<dyn Utility>> = utilities.to_vec();
    while let Some(util) = stack.pop() {
        if contains(&pending, &util) {
            continue;
        }
        stack.extend(util.dependencies());
        pending.push(util);
    }
    pending.sort_by(|a, b| a.state().name.cmp(&b.state().name));

    let mut ordered: Vec<Arc<dyn Utility>> = Vec::with_capacity(pending.len());
    let (roots, mut rest): (Vec<_>, Vec<_>) = pending
        .into_iter()
        .partition(|u| u.dependencies().is_empty());
    ordered.extend(roots);

    while !rest.is_empty() {
        let (ready, blocked): (Vec<_>, Vec<_>) = rest
            .into_iter()
            .partition(|u| u.dependencies().iter().all(|d| contains(&ordered, d)));

        if ready.is_empty() {
            let names: Vec<&str> = blocked.iter().map(|u| u.state().name()).collect();
            return Err(Error::Utility(format!(
                "Circular dependency between utilities: {}",
                names.join(" -> ")
            )));
        }

        ordered.extend(ready);
        rest = blocked;
    }

    Ok(ordered)
}

fn contains(list: &[Arc<dyn Utility>], util: &Arc<dyn Utility>) -> bool {
    list.iter().any(|u| Arc::ptr_eq(u, util))
}

/// Sets up and enters utilities in order, stopping at the first failure.
pub async fn setup_utilities(utilities: &[Arc<dyn Utility>]) -> Result<()> {
    for util in utilities {
        setup_utility(util.as_ref()).await?;
        enter_utility(util.as_ref(), WHERE_DEPENDENCIES).await?;
    }
    Ok(())
}

/// Exits and tears down utilities in reverse order, running every step.
pub async fn teardown_utilities(utilities: &[Arc<dyn Utility>]) -> Result<()> {
    let mut errors = ErrorCollector::new();
    for util in utilities.iter().rev() {
        errors.record(exit_utility(util.as_ref(), WHERE_DEPENDENCIES).await);
        errors.record(teardown_utility(util.as_ref()).await);
    }
    errors.finish(AggregateKind::Teardown, "Unable to teardown utilities")
}

/// Enters every utility at `place`, stopping at the first failure.
///
/// Utilities reached are remembered so that [`exit_utilities`] exits only
/// those.
pub async fn enter_utilities(utilities: &[Arc<dyn Utility>], place: &str) -> Result<()> {
    let op = format!("__enter__{place}");
    for util in utilities {
        util.state().op_state.clear(&op);
    }

    for util in utilities {
        util.state().op_state.set(&op, "called");
        enter_utility(util.as_ref(), place).await?;
    }
    Ok(())
}

/// Exits, in reverse order, every utility entered at `place`.
pub async fn exit_utilities(utilities: &[Arc<dyn Utility>], place: &str) -> Result<()> {
    let op = format!("__enter__{place}");
    let mut errors = ErrorCollector::new();
    for util in utilities.iter().rev() {
        if !util.state().op_state.check(&op, "called") {
            continue;
        }
        errors.record(exit_utility(util.as_ref(), place).await);
    }
    errors.finish(AggregateKind::Teardown, "Unable to exit some utilities")
}

/// Uses a utility created on demand: set up, enter, run `f`, exit and tear
/// down, cleaning up on every path.
///
/// ```rust,ignore
/// let fs = Arc::new(LinuxFileSystem::new(host.clone()));
/// with_utility(&fs, |fs| async move {
///     fs.write("/root/test", "content", None).await
/// })
/// .await?;
/// ```
pub async fn with_utility<U, F, Fut, T>(util: &Arc<U>, f: F) -> Result<T>
where
    U: Utility + 'static,
    F: FnOnce(Arc<U>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let dyn_util: &dyn Utility = util.as_ref();
    dyn_util.state().used.store(true, Ordering::SeqCst);
    setup_utility(dyn_util).await?;

    if let Err(e) = enter_utility(dyn_util, WHERE_SCOPED).await {
        if let Err(exit) = exit_utility(dyn_util, WHERE_SCOPED).await {
            dyn_util.state().logger.error(format!("Utility exit failed: {exit}"));
        }
        if let Err(teardown) = teardown_utility(dyn_util).await {
            dyn_util.state().logger.error(format!("Utility teardown failed: {teardown}"));
        }
        return Err(e);
    }

    let result = f(Arc::clone(util)).await;

    let mut errors = ErrorCollector::new();
    errors.record(exit_utility(dyn_util, WHERE_SCOPED).await);
    errors.record(teardown_utility(dyn_util).await);

    match result {
        Ok(value) => errors.finish_flat().map(|()| value),
        Err(e) => {
            for cleanup in errors.into_errors() {
                dyn_util.state().logger.error(format!("Utility cleanup failed: {cleanup}"));
            }
            Err(e)
        }
    }
}
