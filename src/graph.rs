//! The dependency graph builder.
//!
//! Given a new operation's accessors, computes hazard edges to prior
//! operations touching the same buffers (read-after-write, write-after-read,
//! write-after-write; concurrent reads stay unordered) and synthesizes the
//! migration copies the target device needs. Edges only ever point from
//! earlier-submitted to later-submitted nodes, so the graph is acyclic by
//! construction.

use derive_more::{Deref, Display};
use itertools::Itertools;
use thiserror::Error;

use crate::{
    access::{AccessMode, Accessor},
    buffer::{Buffer, BufferError, BufferId},
    device::{CompletionHandle, CompletionToken, DeviceLoc, Kernel, completion_pair},
};

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct NodeId(uid::Id<NodeId>);

impl NodeId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(uid::Id::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum NodeStatus {
    Pending,
    Ready,
    Dispatched,
    Complete,
    Failed,
}

pub type Callback = Box<dyn FnOnce() + Send>;

pub enum NodeKind {
    KernelLaunch { kernel: Kernel },
    MigrationCopy { buffer: Buffer, from: DeviceLoc },
    HostCallback { callback: Option<Callback> },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::KernelLaunch { .. } => "kernel",
            NodeKind::MigrationCopy { .. } => "migration",
            NodeKind::HostCallback { .. } => "callback",
        }
    }
}

impl std::fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::KernelLaunch { kernel } => {
                f.debug_struct("KernelLaunch").field("kernel", kernel).finish()
            }
            NodeKind::MigrationCopy { buffer, from } => f
                .debug_struct("MigrationCopy")
                .field("buffer", &buffer.id())
                .field("from", from)
                .finish(),
            NodeKind::HostCallback { .. } => f.debug_struct("HostCallback").finish_non_exhaustive(),
        }
    }
}

/// One operation in the execution graph. Owned by the scheduler from
/// insertion to retirement.
#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub target: DeviceLoc,
    pub accessors: Vec<Accessor>,
    /// Predecessors; always earlier-submitted nodes.
    pub deps: Vec<NodeId>,
    pub status: NodeStatus,
    /// Completed by the scheduler when the node retires.
    pub notify: Option<CompletionHandle>,
    /// Backend token, set at dispatch.
    pub token: Option<CompletionToken>,
}

impl Node {
    pub(crate) fn new(id: NodeId, kind: NodeKind, target: DeviceLoc) -> Self {
        Self {
            id,
            kind,
            target,
            accessors: vec![],
            deps: vec![],
            status: NodeStatus::Pending,
            notify: None,
            token: None,
        }
    }

    /// Whether the node references the given buffer, through an accessor or
    /// as a migration.
    pub fn touches(&self, buffer: BufferId) -> bool {
        let accessed = self
            .accessors
            .iter()
            .any(|accessor| accessor.buffer().id() == buffer);
        match &self.kind {
            NodeKind::MigrationCopy { buffer: b, .. } => accessed || b.id() == buffer,
            _ => accessed,
        }
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("violation of write uniqueness rule: {0}")]
    WriteOnly(BufferId),
    #[error("violation of read/write uniqueness rule: {0}")]
    ReadWrite(BufferId),
    #[error("accessor bound to {0} but operation submitted to {1}")]
    DeviceMismatch(DeviceLoc, DeviceLoc),
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// A migration copy synthesized during planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationInfo {
    pub node: NodeId,
    pub buffer: BufferId,
    pub from: DeviceLoc,
    pub to: DeviceLoc,
}

/// The caller's view of one submitted operation: its node, the hazard edges
/// it was inserted with, and the migrations synthesized for it.
#[derive(Debug)]
pub struct OperationHandle {
    id: NodeId,
    target: DeviceLoc,
    deps: Vec<NodeId>,
    migrations: Vec<MigrationInfo>,
    token: CompletionToken,
}

impl OperationHandle {
    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn dependencies(&self) -> &[NodeId] {
        &self.deps
    }

    #[inline]
    pub fn migrations(&self) -> &[MigrationInfo] {
        &self.migrations
    }

    #[inline]
    pub fn token(&self) -> CompletionToken {
        self.token.clone()
    }

    /// Blocks until this operation retires.
    pub async fn wait(&self) -> Result<(), crate::runtime::RuntimeError> {
        self.token
            .wait()
            .await
            .map_err(|source| crate::runtime::RuntimeError::Backend {
                loc: self.target,
                source,
            })
    }
}

pub(crate) struct Submission {
    /// Migrations first, then the operation node.
    pub nodes: Vec<Node>,
    pub handle: OperationHandle,
}

/// Checks mutation uniqueness rules: within one operation, a buffer written
/// by any accessor may not be bound twice.
fn check(accessors: &[Accessor]) -> Result<(), GraphError> {
    for (x, y) in accessors.iter().tuple_combinations() {
        if x.buffer().id() != y.buffer().id() {
            continue;
        }
        let id = x.buffer().id();
        if matches!(x.mode(), AccessMode::WriteOnly) || matches!(y.mode(), AccessMode::WriteOnly) {
            return Err(GraphError::WriteOnly(id));
        }
        if matches!(x.mode(), AccessMode::ReadWrite) || matches!(y.mode(), AccessMode::ReadWrite) {
            return Err(GraphError::ReadWrite(id));
        }
    }
    Ok(())
}

fn plan(
    kind: NodeKind,
    target: DeviceLoc,
    accessors: Vec<Accessor>,
) -> Result<Submission, GraphError> {
    check(&accessors)?;
    for accessor in &accessors {
        if accessor.loc() != target {
            return Err(GraphError::DeviceMismatch(accessor.loc(), target));
        }
    }

    let id = NodeId::new();
    let mut nodes = vec![];
    let mut deps: Vec<NodeId> = vec![];
    let mut migrations = vec![];

    for accessor in &accessors {
        // local/private accessors alias only within one invocation
        if !accessor.hazard_tracked() {
            continue;
        }
        let buffer = accessor.buffer();
        let plan = buffer.plan_access(id, accessor.mode(), target, NodeId::new)?;
        if let Some(migration) = plan.migration {
            migrations.push(MigrationInfo {
                node: migration.node,
                buffer: buffer.id(),
                from: migration.from,
                to: target,
            });
            let mut node = Node::new(
                migration.node,
                NodeKind::MigrationCopy {
                    buffer: buffer.clone(),
                    from: migration.from,
                },
                target,
            );
            node.deps = migration.deps;
            nodes.push(node);
        }
        for dep in plan.deps {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
    }

    let (notify, token) = completion_pair();
    let mut node = Node::new(id, kind, target);
    node.accessors = accessors;
    node.deps = deps.clone();
    node.notify = Some(notify);
    nodes.push(node);

    let handle = OperationHandle {
        id,
        target,
        deps,
        migrations,
        token,
    };
    Ok(Submission { nodes, handle })
}

pub(crate) fn plan_kernel(
    kernel: Kernel,
    target: DeviceLoc,
    accessors: Vec<Accessor>,
) -> Result<Submission, GraphError> {
    plan(NodeKind::KernelLaunch { kernel }, target, accessors)
}

pub(crate) fn plan_callback(
    callback: Callback,
    target: DeviceLoc,
    accessors: Vec<Accessor>,
) -> Result<Submission, GraphError> {
    let callback = Some(callback);
    plan(NodeKind::HostCallback { callback }, target, accessors)
}

#[derive(Debug, Default, Clone, Deref, Display, PartialEq, Eq)]
pub struct Mermaid(pub String);

/// Renders a snapshot of live nodes as a Mermaid diagram.
pub(crate) fn mermaid<'a>(nodes: impl Iterator<Item = &'a Node>) -> Mermaid {
    let mut s = "graph TD\n".to_string();
    let nodes: Vec<_> = nodes.collect();
    for node in &nodes {
        let label = format!("{} @ {} ({})", node.kind.name(), node.target, node.status);
        s.push_str(&format!("    op_{}[\"{label}\"]\n", node.id));
    }
    for node in &nodes {
        for dep in &node.deps {
            s.push_str(&format!("    op_{dep} --> op_{}\n", node.id));
        }
    }
    Mermaid(s)
}

#[cfg(test)]
mod tests {
    use super::{GraphError, plan_kernel};
    use crate::{
        access::{AccessMode, Accessor},
        buffer::Buffer,
        device::{DeviceId, DeviceLoc, Kernel},
        mptr::AddressSpace,
    };

    fn phony() -> Kernel {
        Kernel::new("phony", |_| Ok(()))
    }

    #[test]
    fn test_write_uniqueness() {
        let buffer = Buffer::new(4, 4);
        let d1 = DeviceLoc::Device(DeviceId::new());
        let accessors = vec![
            Accessor::new(buffer.clone(), AccessMode::ReadOnly, d1),
            Accessor::new(buffer.clone(), AccessMode::WriteOnly, d1),
        ];
        let result = plan_kernel(phony(), d1, accessors);
        assert!(matches!(result, Err(GraphError::WriteOnly(_))));

        let accessors = vec![
            Accessor::new(buffer.clone(), AccessMode::ReadWrite, d1),
            Accessor::new(buffer.clone(), AccessMode::ReadOnly, d1),
        ];
        let result = plan_kernel(phony(), d1, accessors);
        assert!(matches!(result, Err(GraphError::ReadWrite(_))));

        // duplicate read-only bindings are allowed
        let accessors = vec![
            Accessor::new(buffer.clone(), AccessMode::ReadOnly, d1),
            Accessor::new(buffer.clone(), AccessMode::ReadOnly, d1),
        ];
        assert!(plan_kernel(phony(), d1, accessors).is_ok());
    }

    #[test]
    fn test_device_mismatch() {
        let buffer = Buffer::new(4, 4);
        let d1 = DeviceLoc::Device(DeviceId::new());
        let d2 = DeviceLoc::Device(DeviceId::new());
        let accessors = vec![Accessor::new(buffer, AccessMode::ReadOnly, d1)];
        let result = plan_kernel(phony(), d2, accessors);
        assert!(matches!(result, Err(GraphError::DeviceMismatch(..))));
    }

    #[test]
    fn test_scratch_untracked() {
        let buffer = Buffer::new(4, 4);
        let scratch = Buffer::new(64, 4);
        let d1 = DeviceLoc::Device(DeviceId::new());
        let accessors = vec![
            Accessor::new(buffer, AccessMode::WriteOnly, d1),
            Accessor::new(scratch.clone(), AccessMode::ReadWrite, d1).space(AddressSpace::Local),
        ];
        let submission = plan_kernel(phony(), d1, accessors).expect("plan");
        // the local accessor contributes neither edges nor migrations,
        // even though a read-write access would otherwise need a copy
        assert!(submission.handle.dependencies().is_empty());
        assert!(submission.handle.migrations().is_empty());
        assert_eq!(submission.nodes.len(), 1);
    }

    #[test]
    fn test_hazard_chain() {
        let buffer = Buffer::new(4, 4);
        let d1 = DeviceLoc::Device(DeviceId::new());
        let d2 = DeviceLoc::Device(DeviceId::new());

        let w1 = plan_kernel(
            phony(),
            d1,
            vec![Accessor::new(buffer.clone(), AccessMode::WriteOnly, d1)],
        )
        .expect("w1");
        assert!(w1.handle.migrations().is_empty());

        let r1 = plan_kernel(
            phony(),
            d1,
            vec![Accessor::new(buffer.clone(), AccessMode::ReadOnly, d1)],
        )
        .expect("r1");
        // w1 will leave d1 authoritative, so the read needs no migration,
        // just the read-after-write edge
        assert_eq!(r1.handle.dependencies(), &[w1.handle.id()]);
        assert!(r1.handle.migrations().is_empty());

        let w2 = plan_kernel(
            phony(),
            d2,
            vec![Accessor::new(buffer.clone(), AccessMode::ReadWrite, d2)],
        )
        .expect("w2");
        assert!(w2.handle.dependencies().contains(&w1.handle.id()));
        assert!(w2.handle.dependencies().contains(&r1.handle.id()));
        // exactly one migration, sourced from where w1 leaves the data
        assert_eq!(w2.handle.migrations().len(), 1);
        assert_eq!(w2.handle.migrations()[0].from, d1);
        assert_eq!(w2.handle.migrations()[0].to, d2);
    }
}
