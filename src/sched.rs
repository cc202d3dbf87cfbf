//! The scheduler and executor.
//!
//! One spawned task owns the live execution graph. Submitting threads never
//! block on device completion: they plan nodes under per-buffer locks and
//! hand them over a channel; the scheduler dispatches ready nodes onto device
//! queues, retires them as completion tokens resolve, and keeps waiters and
//! the coherence tables in step. A failed node poisons its transitive
//! dependents and nothing else; the recorded error surfaces at the next
//! synchronization point observing an affected buffer.

use std::sync::Arc;

use futures::future::join_all;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};

use crate::{
    access::{AccessMode, DevicePolicy},
    buffer::BufferId,
    device::{
        CompletionToken, Device, DeviceError, DeviceEvent, DeviceLoc, completion_pair,
    },
    graph::{Mermaid, Node, NodeId, NodeKind, NodeStatus, mermaid},
    platform,
    runtime::RuntimeError,
};

/// What a synchronization call drains: one buffer's pending operations, one
/// device's queue, or the whole graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitScope {
    All,
    Buffer(BufferId),
    Device(DeviceLoc),
}

pub(crate) enum SchedulerEvent {
    Submit {
        nodes: Vec<Node>,
    },
    Retired {
        id: NodeId,
        result: Result<(), DeviceError>,
    },
    Wait {
        scope: WaitScope,
        sender: flume::Sender<Result<(), RuntimeError>>,
    },
    Destroy {
        buffer: crate::buffer::Buffer,
        sender: flume::Sender<Result<(), RuntimeError>>,
    },
    Mermaid {
        sender: flume::Sender<Mermaid>,
    },
}

struct Waiter {
    scope: WaitScope,
    /// A buffer to free on all devices once its scope drains.
    destroy: Option<crate::buffer::Buffer>,
    sender: flume::Sender<Result<(), RuntimeError>>,
}

struct Poison {
    buffer: Option<BufferId>,
    loc: DeviceLoc,
    error: DeviceError,
}

enum Work {
    Launch {
        kernel: crate::device::Kernel,
        bindings: Vec<crate::device::Binding>,
    },
    Copy {
        buffer: crate::buffer::Buffer,
        from: DeviceLoc,
    },
    Callback(Option<crate::graph::Callback>),
}

/// Retired and failed ids stay in the ledgers this many events after the
/// node left the graph. Retirement and failure purge an id from every hazard
/// index, so only a submission racing with that purge can still name it.
const LEDGER_HORIZON: u64 = 1024;

pub(crate) struct Scheduler {
    devices: HashMap<DeviceLoc, Arc<dyn Device>>,
    /// Live, non-retired nodes.
    nodes: HashMap<NodeId, Node>,
    /// Edges from outstanding nodes to their dependents. An outstanding node
    /// may not have been submitted yet; racing submitters can deliver a
    /// dependent before its predecessor.
    dependents: HashMap<NodeId, Vec<NodeId>>,
    /// Nodes seen retiring successfully, by the event count at retirement.
    /// A dependency neither live nor in this ledger is outstanding.
    retired: HashMap<NodeId, u64>,
    /// Nodes that failed; a dependency on any of them poisons the dependent.
    failed: HashMap<NodeId, u64>,
    /// Nodes already re-targeted once under allocation pressure.
    retried: HashSet<NodeId>,
    poison: Vec<Poison>,
    waiters: Vec<Waiter>,
    /// Loops retirement messages back into the serve loop.
    sender: flume::Sender<SchedulerEvent>,
    /// Count of handled events; drives ledger pruning.
    epoch: u64,
}

impl Scheduler {
    pub fn new(
        devices: HashMap<DeviceLoc, Arc<dyn Device>>,
        sender: flume::Sender<SchedulerEvent>,
    ) -> Self {
        Self {
            devices,
            nodes: HashMap::default(),
            dependents: HashMap::default(),
            retired: HashMap::default(),
            failed: HashMap::default(),
            retried: HashSet::default(),
            poison: vec![],
            waiters: vec![],
            sender,
            epoch: 0,
        }
    }

    fn handle(&mut self, event: SchedulerEvent) {
        self.epoch += 1;
        if self.epoch % 64 == 0 {
            let epoch = self.epoch;
            self.retired.retain(|_, &mut seen| seen + LEDGER_HORIZON > epoch);
            self.failed.retain(|_, &mut seen| seen + LEDGER_HORIZON > epoch);
        }
        match event {
            SchedulerEvent::Submit { nodes } => {
                for node in nodes {
                    self.insert(node);
                }
                self.check_waiters();
            }
            SchedulerEvent::Retired { id, result } => {
                self.retire(id, result);
                self.check_waiters();
            }
            SchedulerEvent::Wait { scope, sender } => {
                self.waiters.push(Waiter {
                    scope,
                    destroy: None,
                    sender,
                });
                self.check_waiters();
            }
            SchedulerEvent::Destroy { buffer, sender } => {
                self.waiters.push(Waiter {
                    scope: WaitScope::Buffer(buffer.id()),
                    destroy: Some(buffer),
                    sender,
                });
                self.check_waiters();
            }
            SchedulerEvent::Mermaid { sender } => {
                _ = sender.send(mermaid(self.nodes.values()));
            }
        }
    }

    fn insert(&mut self, node: Node) {
        if node.deps.iter().any(|dep| self.failed.contains_key(dep)) {
            self.poison_node(node);
            return;
        }
        let id = node.id;
        for dep in node.deps.iter().filter(|dep| !self.retired.contains_key(dep)) {
            self.dependents.entry(*dep).or_default().push(id);
        }
        self.nodes.insert(id, node);
        self.maybe_dispatch(id);
    }

    /// Fails a node before it ever enters the graph.
    fn poison_node(&mut self, mut node: Node) {
        log::warn!("operation {} poisoned by a failed predecessor", node.id);
        self.failed.insert(node.id, self.epoch);
        self.record_poison(&node, DeviceError::Dependency);
        self.purge_hazards(&node);
        node.status = NodeStatus::Failed;
        if let Some(notify) = node.notify.take() {
            notify.complete(Err(DeviceError::Dependency));
        }
        // dependents delivered ahead of this node may already be parked on it
        for dep in self.dependents.remove(&node.id).unwrap_or_default() {
            let dispatched = self
                .nodes
                .get(&dep)
                .map(|node| matches!(node.status, NodeStatus::Dispatched))
                .unwrap_or(true);
            if !dispatched {
                self.fail(dep, DeviceError::Dependency);
            }
        }
    }

    /// Removes a node that will never retire from every touched buffer's
    /// hazard index, so operations planned afterwards take no edge to it.
    fn purge_hazards(&self, node: &Node) {
        for accessor in node.accessors.iter().filter(|a| a.hazard_tracked()) {
            match accessor.mode() {
                AccessMode::ReadOnly => accessor.buffer().forget(node.id),
                _ => accessor.buffer().invalidate(node.id, node.target),
            }
        }
        if let NodeKind::MigrationCopy { buffer, .. } = &node.kind {
            buffer.invalidate(node.id, node.target);
        }
    }

    fn record_poison(&mut self, node: &Node, error: DeviceError) {
        let loc = node.target;
        let buffers: Vec<_> = node
            .accessors
            .iter()
            .map(|accessor| accessor.buffer().id())
            .chain(match &node.kind {
                NodeKind::MigrationCopy { buffer, .. } => Some(buffer.id()),
                _ => None,
            })
            .collect();
        if buffers.is_empty() {
            self.poison.push(Poison {
                buffer: None,
                loc,
                error: error.clone(),
            });
        }
        for buffer in buffers {
            self.poison.push(Poison {
                buffer: Some(buffer),
                loc,
                error: error.clone(),
            });
        }
    }

    /// Dispatches the node if its hazard edges allow. Without native ordering
    /// a node waits for every predecessor to retire; with it, predecessor
    /// tokens are forwarded as soon as every predecessor is at least on a
    /// queue, and the device enforces the edges itself.
    fn maybe_dispatch(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        if !matches!(node.status, NodeStatus::Pending | NodeStatus::Ready) {
            return;
        }

        // a dependency is outstanding until its retirement is seen, even if
        // its own submission has not arrived yet
        let blocking: Vec<NodeId> = node
            .deps
            .iter()
            .copied()
            .filter(|dep| !self.retired.contains_key(dep))
            .collect();
        if blocking.is_empty() {
            self.dispatch(id, vec![]);
            return;
        }

        let native = self
            .devices
            .get(&node.target)
            .map(|device| device.native_ordering())
            .unwrap_or(false);
        if native && !matches!(node.kind, NodeKind::HostCallback { .. }) {
            let tokens: Option<Vec<CompletionToken>> = blocking
                .iter()
                .map(|dep| {
                    let dep = self.nodes.get(dep)?;
                    match dep.status {
                        NodeStatus::Dispatched => dep.token.clone(),
                        _ => None,
                    }
                })
                .collect();
            if let Some(after) = tokens {
                self.dispatch(id, after);
                return;
            }
        }

        if let Some(node) = self.nodes.get_mut(&id) {
            node.status = NodeStatus::Ready;
        }
    }

    fn dispatch(&mut self, id: NodeId, after: Vec<CompletionToken>) {
        let work = {
            let Some(node) = self.nodes.get_mut(&id) else {
                return;
            };
            // cancellation is unsupported from this point on
            node.status = NodeStatus::Dispatched;
            match &mut node.kind {
                NodeKind::KernelLaunch { kernel } => Work::Launch {
                    kernel: kernel.clone(),
                    bindings: node.accessors.iter().map(|a| a.binding()).collect(),
                },
                NodeKind::MigrationCopy { buffer, from } => Work::Copy {
                    buffer: buffer.clone(),
                    from: *from,
                },
                NodeKind::HostCallback { callback } => Work::Callback(callback.take()),
            }
        };

        match work {
            Work::Launch { kernel, bindings } => {
                let target = self.nodes[&id].target;
                let Some(device) = self.devices.get(&target).cloned() else {
                    self.retire(id, Err(DeviceError::Closed));
                    return;
                };
                log::trace!("dispatching kernel {} to {target}", kernel.name());
                let (handle, token) = completion_pair();
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.token = Some(token.clone());
                }
                device.execute(DeviceEvent::Launch {
                    kernel,
                    bindings,
                    after,
                    handle,
                });
                self.forward(id, token);
            }
            Work::Copy { buffer, from } => {
                let target = self.nodes[&id].target;
                let (src, dst) = match (self.devices.get(&from), self.devices.get(&target)) {
                    (Some(src), Some(dst)) => (src.clone(), dst.clone()),
                    _ => {
                        self.retire(id, Err(DeviceError::Closed));
                        return;
                    }
                };
                log::trace!("migrating {} from {from} to {target}", buffer.id());
                let (handle, token) = completion_pair();
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.token = Some(token.clone());
                }
                let bid = buffer.id();
                platform::spawn(async move {
                    let result = async {
                        let results = join_all(after.iter().map(CompletionToken::wait)).await;
                        if results.into_iter().any(|result| result.is_err()) {
                            return Err(DeviceError::Dependency);
                        }
                        let (sender, receiver) = flume::bounded(1);
                        src.execute(DeviceEvent::Download { id: bid, sender });
                        let data = receiver
                            .recv_async()
                            .await
                            .map_err(|_| DeviceError::Closed)??;
                        let (handle, token) = completion_pair();
                        dst.execute(DeviceEvent::Upload {
                            id: bid,
                            data,
                            handle,
                        });
                        token.wait().await
                    }
                    .await;
                    handle.complete(result);
                });
                self.forward(id, token);
            }
            Work::Callback(callback) => {
                // callbacks are cheap notification hooks; they run right here
                if let Some(callback) = callback {
                    callback();
                }
                self.retire(id, Ok(()));
            }
        }

        // native chaining: dependents may be eligible now
        for dep in self.dependents.get(&id).cloned().unwrap_or_default() {
            self.maybe_dispatch(dep);
        }
    }

    /// Feeds a backend token's resolution back into the serve loop.
    fn forward(&self, id: NodeId, token: CompletionToken) {
        let sender = self.sender.clone();
        platform::spawn(async move {
            let result = token.wait().await;
            _ = sender
                .send_async(SchedulerEvent::Retired { id, result })
                .await;
        });
    }

    fn retire(&mut self, id: NodeId, result: Result<(), DeviceError>) {
        match result {
            Ok(()) => self.complete(id),
            Err(error) => {
                if self.retryable(id, &error, None) {
                    self.retry(id);
                } else if !self.migration_retry(id, &error) {
                    self.fail(id, error);
                }
            }
        }
    }

    fn complete(&mut self, id: NodeId) {
        let Some(mut node) = self.nodes.remove(&id) else {
            return;
        };
        self.retired.insert(id, self.epoch);
        self.retried.remove(&id);
        node.status = NodeStatus::Complete;
        match &node.kind {
            NodeKind::MigrationCopy { buffer, .. } => buffer.mark_copied(id, node.target),
            _ => {
                for accessor in node.accessors.iter().filter(|a| a.hazard_tracked()) {
                    accessor
                        .buffer()
                        .mark_retired(id, accessor.mode(), node.target);
                }
            }
        }
        if let Some(notify) = node.notify.take() {
            notify.complete(Ok(()));
        }
        log::trace!("retired {} {id}", node.kind.name());
        for dep in self.dependents.remove(&id).unwrap_or_default() {
            self.maybe_dispatch(dep);
        }
    }

    /// Marks the node failed and poisons its transitive dependents, leaving
    /// unrelated graph regions untouched. Dependents already on a device
    /// queue surface the failure through their own tokens.
    fn fail(&mut self, id: NodeId, error: DeviceError) {
        let Some(mut node) = self.nodes.remove(&id) else {
            return;
        };
        node.status = NodeStatus::Failed;
        self.failed.insert(id, self.epoch);
        self.retried.remove(&id);
        log::warn!("operation {id} failed on {}: {error}", node.target);
        self.record_poison(&node, error.clone());
        self.purge_hazards(&node);
        if let Some(notify) = node.notify.take() {
            notify.complete(Err(error));
        }
        for dep in self.dependents.remove(&id).unwrap_or_default() {
            let dispatched = self
                .nodes
                .get(&dep)
                .map(|node| matches!(node.status, NodeStatus::Dispatched))
                .unwrap_or(true);
            if !dispatched {
                self.fail(dep, DeviceError::Dependency);
            }
        }
    }

    /// Transient allocation pressure may be retried against another device,
    /// but only when every accessor's device constraint is advisory.
    /// `excluded` names a failing copy predecessor being absorbed into the
    /// retry.
    fn retryable(&self, id: NodeId, error: &DeviceError, excluded: Option<NodeId>) -> bool {
        if !matches!(error, DeviceError::Alloc { .. }) || self.retried.contains(&id) {
            return false;
        }
        let Some(node) = self.nodes.get(&id) else {
            return false;
        };
        matches!(node.kind, NodeKind::KernelLaunch { .. })
            && !node.accessors.is_empty()
            && node
                .accessors
                .iter()
                .all(|accessor| accessor.policy() == DevicePolicy::Advisory)
            // under native ordering the node may have been dispatched before
            // its predecessors retired; re-targeting is only safe once they
            // are all done
            && node
                .deps
                .iter()
                .all(|dep| self.retired.contains_key(dep) || Some(*dep) == excluded)
            && self.alternate(node.target).is_some()
    }

    /// Allocation pressure inside a synthesized copy counts against the
    /// kernels depending on it: when every one of them is an all-advisory
    /// launch, the copy node is dropped and each kernel re-targets with its
    /// own fresh migrations.
    fn migration_retry(&mut self, id: NodeId, error: &DeviceError) -> bool {
        if !matches!(error, DeviceError::Alloc { .. }) {
            return false;
        }
        let Some(node) = self.nodes.get(&id) else {
            return false;
        };
        let NodeKind::MigrationCopy { buffer, .. } = &node.kind else {
            return false;
        };
        // a dependent already on a device queue cannot be re-targeted
        let dependents: Vec<NodeId> = self
            .dependents
            .get(&id)
            .map(|deps| {
                deps.iter()
                    .copied()
                    .filter(|dep| {
                        self.nodes.get(dep).is_some_and(|node| {
                            matches!(node.status, NodeStatus::Pending | NodeStatus::Ready)
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        if dependents.is_empty()
            || !dependents
                .iter()
                .all(|&dep| self.retryable(dep, error, Some(id)))
        {
            return false;
        }

        log::warn!("absorbing failed migration {id} into a re-targeted launch");
        let buffer = buffer.clone();
        let target = node.target;
        self.nodes.remove(&id);
        self.dependents.remove(&id);
        // a racing submission may still name the copy; poison it like any
        // other dependent of a failed node
        self.failed.insert(id, self.epoch);
        buffer.invalidate(id, target);
        for dep in dependents {
            self.retry(dep);
        }
        true
    }

    fn alternate(&self, current: DeviceLoc) -> Option<DeviceLoc> {
        self.devices
            .keys()
            .copied()
            .find(|&loc| loc != current && loc != DeviceLoc::Host)
            .or_else(|| self.devices.keys().copied().find(|&loc| loc != current))
    }

    fn retry(&mut self, id: NodeId) {
        self.retried.insert(id);
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let Some(alt) = self.alternate(node.target) else {
            return;
        };
        log::warn!(
            "retrying operation {id} on {alt} after allocation pressure on {}",
            node.target
        );
        let accessors = node.accessors.clone();

        // the node's hazard position is held, so its predecessors are done
        // and its dependents still wait on it; copying from the live
        // authoritative location is race-free here
        let mut deps = vec![];
        for accessor in accessors.iter().filter(|a| a.hazard_tracked()) {
            if matches!(accessor.mode(), AccessMode::WriteOnly) {
                continue;
            }
            let buffer = accessor.buffer();
            if buffer.valid_at(alt) {
                continue;
            }
            let Some(from) = buffer.authoritative() else {
                continue;
            };
            let mid = NodeId::new();
            let migration = Node::new(
                mid,
                NodeKind::MigrationCopy {
                    buffer: buffer.clone(),
                    from,
                },
                alt,
            );
            deps.push(mid);
            self.insert(migration);
        }

        if let Some(node) = self.nodes.get_mut(&id) {
            node.target = alt;
            node.status = NodeStatus::Pending;
            node.token = None;
            node.deps = deps.clone();
        }
        for dep in &deps {
            self.dependents.entry(*dep).or_default().push(id);
        }
        self.maybe_dispatch(id);
    }

    fn drained(&self, scope: &WaitScope) -> bool {
        match scope {
            WaitScope::All => self.nodes.is_empty(),
            WaitScope::Buffer(buffer) => !self.nodes.values().any(|node| node.touches(*buffer)),
            WaitScope::Device(loc) => !self.nodes.values().any(|node| node.target == *loc),
        }
    }

    fn take_poison(&mut self, scope: &WaitScope) -> Option<RuntimeError> {
        let index = self.poison.iter().position(|poison| match scope {
            WaitScope::All => true,
            WaitScope::Buffer(buffer) => poison.buffer == Some(*buffer),
            WaitScope::Device(loc) => poison.loc == *loc,
        })?;
        let Poison { loc, error, .. } = self.poison.remove(index);
        Some(RuntimeError::Backend { loc, source: error })
    }

    fn check_waiters(&mut self) {
        let waiters = std::mem::take(&mut self.waiters);
        for waiter in waiters {
            if !self.drained(&waiter.scope) {
                self.waiters.push(waiter);
                continue;
            }
            let result = match self.take_poison(&waiter.scope) {
                Some(error) => Err(error),
                None => Ok(()),
            };
            if let Some(buffer) = waiter.destroy {
                // drained: nothing referencing the buffer is live, so the
                // device copies can be released
                for device in self.devices.values() {
                    device.execute(DeviceEvent::Free { id: buffer.id() });
                }
            }
            _ = waiter.sender.send(result);
        }
    }
}

pub(crate) async fn serve(mut scheduler: Scheduler, receiver: flume::Receiver<SchedulerEvent>) {
    while let Ok(event) = receiver.recv_async().await {
        scheduler.handle(event);
    }
}

#[cfg(test)]
mod tests {
    use rustc_hash::FxHashMap as HashMap;

    use super::{LEDGER_HORIZON, Scheduler, SchedulerEvent};
    use crate::{
        device::DeviceLoc,
        graph::{Node, NodeId, NodeKind},
    };

    fn callback_node() -> Node {
        Node::new(
            NodeId::new(),
            NodeKind::HostCallback { callback: None },
            DeviceLoc::Host,
        )
    }

    #[test]
    fn test_ledger_pruning() {
        let (sender, _receiver) = flume::unbounded();
        let mut scheduler = Scheduler::new(HashMap::default(), sender);

        // a callback with no dependencies retires inline
        let node = callback_node();
        let first = node.id;
        scheduler.handle(SchedulerEvent::Submit { nodes: vec![node] });
        assert!(scheduler.nodes.is_empty());
        assert!(scheduler.retired.contains_key(&first));

        // ledgers do not grow with the life of the process
        for _ in 0..2 * LEDGER_HORIZON {
            scheduler.handle(SchedulerEvent::Submit { nodes: vec![] });
        }
        assert!(!scheduler.retired.contains_key(&first));

        let node = callback_node();
        let second = node.id;
        scheduler.handle(SchedulerEvent::Submit { nodes: vec![node] });
        assert!(scheduler.retired.contains_key(&second));
    }

    #[test]
    fn test_unseen_dependency_blocks() {
        let (sender, _receiver) = flume::unbounded();
        let mut scheduler = Scheduler::new(HashMap::default(), sender);

        // the dependent arrives before its predecessor's submission
        let predecessor = callback_node();
        let mut dependent = callback_node();
        dependent.deps = vec![predecessor.id];
        let id = dependent.id;

        scheduler.handle(SchedulerEvent::Submit {
            nodes: vec![dependent],
        });
        assert!(scheduler.nodes.contains_key(&id));

        scheduler.handle(SchedulerEvent::Submit {
            nodes: vec![predecessor],
        });
        assert!(!scheduler.nodes.contains_key(&id));
        assert!(scheduler.retired.contains_key(&id));
    }
}
