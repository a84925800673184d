// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The dependency tree of mapped devices, and the orchestrated walks
//! over it.
//!
//! The tree is an ephemeral plan: built fresh from the registry before
//! each orchestrated operation, walked, discarded. Nodes live in an
//! arena and refer to each other by index; devices and nodes are
//! linked by UUID, never by address, so rebuilding a tree never
//! invalidates device records. A sentinel root is the parent of every
//! node with no other parents and the child of every node with no
//! other children, so walks in either direction have a universal
//! starting point.
//!
//! Activation walks dependencies-first (children before parents);
//! suspension and removal walk dependents-first. Within a walk the
//! order is the topological order of the scoped sub-graph, ties broken
//! by ascending (major, minor). A failure stops progress along its own
//! path but sibling paths continue; callers read the per-node report.

use std::{
    any::Any,
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{
    core::{DevId, Device, DmControl, DmFlags, DmName, DmNameBuf, DmOptions, DmUuid, DmUuidBuf},
    registry::{DevFlags, DeviceRegistry, TableSlot},
    result::{DmError, DmResult, ErrorEnum},
};

/// Index of a node in its tree's arena.
pub type NodeId = usize;

const ROOT: NodeId = 0;

/// One node of the dependency tree. Children are the devices this
/// node's tables reference as backing storage; parents are the devices
/// stacked on top of it.
pub struct TreeNode {
    name: Option<DmNameBuf>,
    uuid: Option<DmUuidBuf>,
    device: Option<Device>,
    children: Vec<NodeId>,
    parents: Vec<NodeId>,
    context: Option<Box<dyn Any>>,
}

impl TreeNode {
    /// The device's name; None for the sentinel root.
    pub fn name(&self) -> Option<&DmName> {
        self.name.as_deref()
    }

    /// The device's UUID; None for the sentinel root.
    pub fn uuid(&self) -> Option<&DmUuid> {
        self.uuid.as_deref()
    }

    /// The device numbers, if the device is realised.
    pub fn device(&self) -> Option<Device> {
        self.device
    }

    /// The opaque handle attached with `set_context`, if any.
    pub fn context(&self) -> Option<&dyn Any> {
        self.context.as_deref()
    }
}

impl fmt::Debug for TreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeNode")
            .field("name", &self.name)
            .field("uuid", &self.uuid)
            .field("device", &self.device)
            .field("children", &self.children)
            .field("parents", &self.parents)
            .finish()
    }
}

/// Aggregate result of a planner walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStatus {
    /// Every in-scope node succeeded or was cleanly skipped.
    Success,
    /// At least one node was busy, blocked, failed, or cancelled.
    PartialFailure,
}

/// What happened to one node during a planner walk.
#[derive(Debug)]
pub enum NodeDisposition {
    /// The operation was issued and succeeded.
    Done,
    /// The node's UUID is outside the walk's scope; it was not
    /// touched.
    OutOfScope,
    /// The node needed nothing (no staged table, not realised, or
    /// already in the requested state).
    Skipped,
    /// An open count prevented removal.
    Busy,
    /// Removal was deferred to the device's last close.
    Deferred,
    /// A failure earlier on this node's path stopped progress.
    Blocked,
    /// The walk was cancelled before this node was processed.
    Cancelled,
    /// The operation was issued and failed.
    Failed(DmError),
}

impl NodeDisposition {
    fn is_clean(&self) -> bool {
        matches!(
            self,
            NodeDisposition::Done
                | NodeDisposition::OutOfScope
                | NodeDisposition::Skipped
                | NodeDisposition::Deferred
        )
    }

    fn halts_path(&self) -> bool {
        matches!(
            self,
            NodeDisposition::Busy | NodeDisposition::Failed(_) | NodeDisposition::Blocked
        )
    }
}

/// The outcome for one node.
#[derive(Debug)]
pub struct NodeReport {
    /// The node's name; None for the sentinel root.
    pub name: Option<DmNameBuf>,
    /// The node's UUID; None for the sentinel root.
    pub uuid: Option<DmUuidBuf>,
    /// The node's device numbers, if realised.
    pub device: Option<Device>,
    /// What happened.
    pub disposition: NodeDisposition,
}

/// Per-node outcomes of a planner walk, in walk order.
#[derive(Debug, Default)]
pub struct WalkReport {
    reports: Vec<NodeReport>,
}

impl WalkReport {
    /// The per-node outcomes, in the order the walk visited them.
    pub fn reports(&self) -> &[NodeReport] {
        &self.reports
    }

    /// Success iff every in-scope node succeeded or was cleanly
    /// skipped.
    pub fn status(&self) -> WalkStatus {
        if self.reports.iter().all(|r| r.disposition.is_clean()) {
            WalkStatus::Success
        } else {
            WalkStatus::PartialFailure
        }
    }

    fn extend(&mut self, other: WalkReport) {
        self.reports.extend(other.reports);
    }
}

/// The dependency tree.
#[derive(Debug)]
pub struct DmTree {
    nodes: Vec<TreeNode>,
    by_uuid: HashMap<DmUuidBuf, NodeId>,
    by_dev: HashMap<Device, NodeId>,
    cancel: Option<Arc<AtomicBool>>,
}

impl DmTree {
    /// The sentinel root node's id.
    pub const ROOT: NodeId = ROOT;

    /// Build a tree over every device in the registry. Edges come
    /// from the target areas of each device's live and inactive
    /// tables. Fails with CyclicDependency if the references do not
    /// form a DAG; no tree is returned and nothing is mutated.
    pub fn build(registry: &DeviceRegistry) -> DmResult<DmTree> {
        let mut tree = DmTree {
            nodes: vec![TreeNode {
                name: None,
                uuid: None,
                device: None,
                children: Vec::new(),
                parents: Vec::new(),
                context: None,
            }],
            by_uuid: HashMap::new(),
            by_dev: HashMap::new(),
            cancel: None,
        };

        let mut by_name: HashMap<DmNameBuf, NodeId> = HashMap::new();
        for record in registry.devices() {
            let id = tree.nodes.len();
            tree.nodes.push(TreeNode {
                name: Some(record.name().to_owned()),
                uuid: Some(record.uuid().to_owned()),
                device: record.device(),
                children: Vec::new(),
                parents: Vec::new(),
                context: None,
            });
            tree.by_uuid.insert(record.uuid().to_owned(), id);
            by_name.insert(record.name().to_owned(), id);
            if let Some(device) = record.device() {
                tree.by_dev.insert(device, id);
            }
        }

        for (idx, record) in registry.devices().enumerate() {
            let parent = idx + 1;
            for table in [record.live_table(), record.inactive_table()]
                .into_iter()
                .flatten()
            {
                for target in table.targets() {
                    for area in target.areas() {
                        let child = tree
                            .by_uuid
                            .get(area.uuid())
                            .or_else(|| by_name.get(area.name().as_ref()))
                            .copied()
                            .ok_or_else(|| {
                                DmError::Dm(
                                    ErrorEnum::NotFound,
                                    format!(
                                        "device {} references unknown backing device {}",
                                        record.name(),
                                        area.name()
                                    ),
                                )
                            })?;
                        tree.add_edge(parent, child);
                    }
                }
            }
        }

        tree.check_acyclic()?;

        for id in 1..tree.nodes.len() {
            if tree.nodes[id].parents.is_empty() {
                tree.add_edge(ROOT, id);
            }
        }
        for id in 1..tree.nodes.len() {
            if tree.nodes[id].children.is_empty() {
                tree.add_edge(id, ROOT);
            }
        }

        tree.sort_adjacency();

        debug!("Built dependency tree over {} devices", tree.nodes.len() - 1);
        Ok(tree)
    }

    fn add_edge(&mut self, parent: NodeId, child: NodeId) {
        if !self.nodes[parent].children.contains(&child) {
            self.nodes[parent].children.push(child);
        }
        if !self.nodes[child].parents.contains(&parent) {
            self.nodes[child].parents.push(parent);
        }
    }

    /// Walk order key: realised devices ascending by (major, minor),
    /// then unrealised by name, the root last.
    fn sort_key(&self, id: NodeId) -> (u8, u32, u32, String) {
        if id == ROOT {
            return (2, 0, 0, String::new());
        }
        let node = &self.nodes[id];
        let name = node.name.as_ref().map_or_else(String::new, |n| n.to_string());
        match node.device {
            Some(device) => (0, device.major, device.minor, name),
            None => (1, 0, 0, name),
        }
    }

    fn sort_adjacency(&mut self) {
        let keys: Vec<_> = (0..self.nodes.len()).map(|id| self.sort_key(id)).collect();
        for node in &mut self.nodes {
            node.children.sort_by(|a, b| keys[*a].cmp(&keys[*b]));
            node.parents.sort_by(|a, b| keys[*a].cmp(&keys[*b]));
        }
    }

    fn check_acyclic(&self) -> DmResult<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Colour {
            White,
            Grey,
            Black,
        }

        let mut colour = vec![Colour::White; self.nodes.len()];
        for start in 1..self.nodes.len() {
            if colour[start] != Colour::White {
                continue;
            }

            let mut stack = vec![(start, 0usize)];
            colour[start] = Colour::Grey;
            while let Some((node, idx)) = stack.pop() {
                let children = &self.nodes[node].children;
                if idx < children.len() {
                    stack.push((node, idx + 1));
                    let child = children[idx];
                    match colour[child] {
                        Colour::White => {
                            colour[child] = Colour::Grey;
                            stack.push((child, 0));
                        }
                        Colour::Grey => {
                            return Err(DmError::Dm(
                                ErrorEnum::CyclicDependency,
                                format!(
                                    "dependency cycle through device {}",
                                    self.nodes[child]
                                        .name
                                        .as_ref()
                                        .map_or_else(String::new, |n| n.to_string())
                                ),
                            ));
                        }
                        Colour::Black => {}
                    }
                } else {
                    colour[node] = Colour::Black;
                }
            }
        }
        Ok(())
    }

    /// The number of nodes, the sentinel root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree holds no device nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// The node for the given device numbers. (0, 0) names the root.
    pub fn find_node(&self, major: u32, minor: u32) -> Option<NodeId> {
        if major == 0 && minor == 0 {
            return Some(ROOT);
        }
        self.by_dev.get(&Device { major, minor }).copied()
    }

    /// The node for the given UUID. The empty UUID names the root.
    pub fn find_node_by_uuid(&self, uuid: &DmUuid) -> Option<NodeId> {
        if uuid.as_bytes().is_empty() {
            return Some(ROOT);
        }
        self.by_uuid.get(uuid).copied()
    }

    /// The node at `id`.
    pub fn node(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(id)
    }

    /// Attach an opaque handle to a node.
    pub fn set_context(&mut self, id: NodeId, context: Box<dyn Any>) -> DmResult<()> {
        match self.nodes.get_mut(id) {
            Some(node) => {
                node.context = Some(context);
                Ok(())
            }
            None => Err(DmError::Dm(
                ErrorEnum::NotFound,
                format!("no tree node {id}"),
            )),
        }
    }

    /// The ids adjacent to `id`: its children, or with `inverted` its
    /// parents. The sentinel root appears where it is wired.
    pub fn children(&self, id: NodeId, inverted: bool) -> impl Iterator<Item = NodeId> + '_ {
        let adjacency = if inverted {
            &self.nodes[id].parents
        } else {
            &self.nodes[id].children
        };
        adjacency.iter().copied()
    }

    /// The number of children of `id`, or with `inverted` its
    /// parents, the sentinel root excluded.
    pub fn num_children(&self, id: NodeId, inverted: bool) -> usize {
        self.children(id, inverted).filter(|&c| c != ROOT).count()
    }

    /// Install a cooperative cancellation flag, checked at every node
    /// boundary of subsequent walks.
    pub fn set_cancel(&mut self, cancel: Arc<AtomicBool>) {
        self.cancel = Some(cancel);
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::Relaxed))
    }

    fn in_scope(&self, id: NodeId, uuid_prefix: &str) -> bool {
        if id == ROOT {
            return true;
        }
        self.nodes[id]
            .uuid
            .as_ref()
            .map_or(false, |uuid| {
                uuid.as_bytes().starts_with(uuid_prefix.as_bytes())
            })
    }

    /// Whether any descendant of `id` is in the administrative domain
    /// named by `uuid_prefix`. Short-circuits on the first hit.
    pub fn children_use_uuid(&self, id: NodeId, uuid_prefix: &str) -> bool {
        let mut seen = HashSet::new();
        let mut stack: Vec<NodeId> = self.nodes[id]
            .children
            .iter()
            .copied()
            .filter(|&c| c != ROOT)
            .collect();

        while let Some(n) = stack.pop() {
            if !seen.insert(n) {
                continue;
            }
            if self.in_scope(n, uuid_prefix) {
                return true;
            }
            stack.extend(self.nodes[n].children.iter().copied().filter(|&c| c != ROOT));
        }
        false
    }

    /// The sub-graph reachable from `start` through children edges, in
    /// topological order: dependents first, or dependencies first with
    /// `inverted`. `start` itself is included unless it is the root.
    /// Ties break by ascending (major, minor), unrealised devices
    /// after realised ones by name.
    fn scoped_order(&self, start: NodeId, inverted: bool) -> Vec<NodeId> {
        let mut reachable = HashSet::new();
        let mut stack = Vec::new();
        if start == ROOT {
            stack.extend(self.nodes[ROOT].children.iter().copied());
        } else {
            stack.push(start);
        }
        while let Some(n) = stack.pop() {
            if n == ROOT || !reachable.insert(n) {
                continue;
            }
            stack.extend(self.nodes[n].children.iter().copied());
        }

        let mut degree: HashMap<NodeId, usize> = HashMap::new();
        for &n in &reachable {
            let waits_on = if inverted {
                &self.nodes[n].children
            } else {
                &self.nodes[n].parents
            };
            degree.insert(
                n,
                waits_on.iter().filter(|p| reachable.contains(p)).count(),
            );
        }

        let mut ready: Vec<NodeId> = degree
            .iter()
            .filter_map(|(&n, &d)| (d == 0).then_some(n))
            .collect();
        let mut order = Vec::with_capacity(reachable.len());
        while !ready.is_empty() {
            let mut best = 0;
            for i in 1..ready.len() {
                if self.sort_key(ready[i]) < self.sort_key(ready[best]) {
                    best = i;
                }
            }
            let n = ready.swap_remove(best);
            order.push(n);

            let unblocks = if inverted {
                &self.nodes[n].parents
            } else {
                &self.nodes[n].children
            };
            for &s in unblocks {
                if let Some(d) = degree.get_mut(&s) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(s);
                    }
                }
            }
        }

        order
    }

    fn make_report(node: &TreeNode, disposition: NodeDisposition) -> NodeReport {
        NodeReport {
            name: node.name.clone(),
            uuid: node.uuid.clone(),
            device: node.device,
            disposition,
        }
    }

    /// Shared walk driver: visits the scoped order, keeps
    /// out-of-scope nodes untouched, blocks nodes below a failure,
    /// and honours cancellation at each node boundary.
    fn run_walk(
        &self,
        registry: &mut DeviceRegistry,
        dm: &mut dyn DmControl,
        start: NodeId,
        uuid_prefix: &str,
        inverted: bool,
        op: &mut dyn FnMut(
            &mut DeviceRegistry,
            &mut dyn DmControl,
            &TreeNode,
        ) -> DmResult<NodeDisposition>,
    ) -> WalkReport {
        let order = self.scoped_order(start, inverted);
        let mut failed: HashSet<NodeId> = HashSet::new();
        let mut report = WalkReport::default();
        let mut cancelled = false;

        for &id in &order {
            let node = &self.nodes[id];

            if cancelled || self.cancelled() {
                cancelled = true;
                report
                    .reports
                    .push(Self::make_report(node, NodeDisposition::Cancelled));
                continue;
            }

            let waits_on = if inverted { &node.children } else { &node.parents };
            let path_failed = waits_on.iter().any(|p| failed.contains(p));

            if !self.in_scope(id, uuid_prefix) {
                // Visited for traversal only; a failure below an
                // out-of-scope node still poisons the path through it.
                if path_failed {
                    failed.insert(id);
                }
                report
                    .reports
                    .push(Self::make_report(node, NodeDisposition::OutOfScope));
                continue;
            }

            if path_failed {
                failed.insert(id);
                report
                    .reports
                    .push(Self::make_report(node, NodeDisposition::Blocked));
                continue;
            }

            let disposition = match op(registry, dm, node) {
                Ok(disposition) => disposition,
                Err(err) => NodeDisposition::Failed(err),
            };
            if disposition.halts_path() {
                failed.insert(id);
            }
            report.reports.push(Self::make_report(node, disposition));
        }

        report
    }

    fn node_dev_id(node: &TreeNode) -> DmResult<&DmUuid> {
        node.uuid().ok_or_else(|| {
            DmError::Dm(
                ErrorEnum::NotFound,
                "the sentinel root has no device".into(),
            )
        })
    }

    /// Stage new tables below `node`, dependencies first: for each
    /// in-scope node with an inactive table, compile its index and
    /// submit a create (if the device is not yet realised) or a
    /// reload. Live I/O is not disturbed. With `resume_after`, follow
    /// with an activation walk over the same sub-graph.
    pub fn preload_children(
        &self,
        node: NodeId,
        uuid_prefix: &str,
        resume_after: bool,
        registry: &mut DeviceRegistry,
        dm: &mut dyn DmControl,
    ) -> DmResult<WalkReport> {
        let mut report = self.run_walk(
            registry,
            dm,
            node,
            uuid_prefix,
            true,
            &mut |registry, dm, node| {
                let uuid = Self::node_dev_id(node)?;
                let id = DevId::Uuid(uuid);

                let (name, realised, read_only, has_inactive) = {
                    let record = registry.get(&id)?;
                    (
                        record.name().to_owned(),
                        record.device().is_some(),
                        record.flags().contains(DevFlags::READ_ONLY),
                        record.inactive_table().is_some(),
                    )
                };

                if !has_inactive {
                    return Ok(NodeDisposition::Skipped);
                }

                registry.complete_inactive(&id)?;
                let lines = registry.load_lines(&id, TableSlot::Inactive)?;

                let options = if read_only {
                    DmOptions::default().set_flags(DmFlags::DM_READONLY)
                } else {
                    DmOptions::default()
                };

                if !realised {
                    let info = dm.device_create(&name, Some(uuid), options)?;
                    registry.update_from_info(&id, &info)?;
                }

                let info = dm.table_load(&id, &lines, options)?;
                registry.update_from_info(&id, &info)?;

                Ok(NodeDisposition::Done)
            },
        );

        if resume_after {
            report.extend(self.activate_children(node, uuid_prefix, registry, dm)?);
        }

        Ok(report)
    }

    /// Resume below `node`, dependencies first: every in-scope node
    /// with a staged table, or left suspended, is resumed. Resume
    /// promotes the inactive table to live atomically at the kernel
    /// boundary and bumps the event counter.
    pub fn activate_children(
        &self,
        node: NodeId,
        uuid_prefix: &str,
        registry: &mut DeviceRegistry,
        dm: &mut dyn DmControl,
    ) -> DmResult<WalkReport> {
        Ok(self.run_walk(
            registry,
            dm,
            node,
            uuid_prefix,
            true,
            &mut |registry, dm, node| {
                let uuid = Self::node_dev_id(node)?;
                let id = DevId::Uuid(uuid);

                let (realised, suspended, has_inactive) = {
                    let record = registry.get(&id)?;
                    (
                        record.device().is_some(),
                        record.flags().contains(DevFlags::SUSPENDED),
                        record.inactive_table().is_some(),
                    )
                };

                if !realised || (!has_inactive && !suspended) {
                    return Ok(NodeDisposition::Skipped);
                }

                let info = dm.device_suspend(&id, DmOptions::default())?;
                registry.promote_inactive(&id)?;
                registry.update_from_info(&id, &info)?;

                Ok(NodeDisposition::Done)
            },
        ))
    }

    /// Suspend below `node`, dependents first. The filesystem freeze
    /// is requested only at the top of each in-scope stack; devices
    /// below are suspended with the lockfs hint skipped so
    /// filesystems quiesce once, not per layer.
    pub fn suspend_children(
        &self,
        node: NodeId,
        uuid_prefix: &str,
        registry: &mut DeviceRegistry,
        dm: &mut dyn DmControl,
    ) -> DmResult<WalkReport> {
        Ok(self.run_walk(
            registry,
            dm,
            node,
            uuid_prefix,
            false,
            &mut |registry, dm, node| {
                let uuid = Self::node_dev_id(node)?;
                let id = DevId::Uuid(uuid);

                let (realised, suspended, has_live) = {
                    let record = registry.get(&id)?;
                    (
                        record.device().is_some(),
                        record.flags().contains(DevFlags::SUSPENDED),
                        record.live_table().is_some(),
                    )
                };

                if !realised || suspended || !has_live {
                    return Ok(NodeDisposition::Skipped);
                }

                let mut flags = DmFlags::DM_SUSPEND;
                let below_stack_top = node
                    .parents
                    .iter()
                    .any(|&p| p != ROOT && self.in_scope(p, uuid_prefix));
                if below_stack_top {
                    flags |= DmFlags::DM_SKIP_LOCKFS;
                }

                let info = dm.device_suspend(&id, DmOptions::default().set_flags(flags))?;
                registry.mark_suspended(&id)?;
                registry.update_from_info(&id, &info)?;

                Ok(NodeDisposition::Done)
            },
        ))
    }

    /// Remove below `node`, dependents first. A node with a non-zero
    /// open count is skipped with Busy, or handed to the kernel for
    /// deferred removal when the device record asks for it; the walk
    /// succeeds iff every in-scope node was removed or deferred.
    pub fn deactivate_children(
        &self,
        node: NodeId,
        uuid_prefix: &str,
        registry: &mut DeviceRegistry,
        dm: &mut dyn DmControl,
    ) -> DmResult<WalkReport> {
        Ok(self.run_walk(
            registry,
            dm,
            node,
            uuid_prefix,
            false,
            &mut |registry, dm, node| {
                let uuid = Self::node_dev_id(node)?;
                let id = DevId::Uuid(uuid);

                let (realised, deferred) = {
                    let record = registry.get(&id)?;
                    (
                        record.device().is_some(),
                        record.flags().contains(DevFlags::DEFERRED_REMOVE),
                    )
                };

                if !realised {
                    // Never reached the kernel; only the record goes.
                    registry.remove(&id)?;
                    return Ok(NodeDisposition::Done);
                }

                let info = dm.device_info(&id)?;
                registry.update_from_info(&id, &info)?;

                if info.open_count > 0 {
                    if deferred {
                        dm.device_remove(
                            &id,
                            DmOptions::default().set_flags(DmFlags::DM_DEFERRED_REMOVE),
                        )?;
                        return Ok(NodeDisposition::Deferred);
                    }
                    return Ok(NodeDisposition::Busy);
                }

                dm.device_remove(&id, DmOptions::default())?;
                registry.remove(&id)?;

                Ok(NodeDisposition::Done)
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::{
        core::{DmInfo, TargetLine},
        table::TargetTable,
        target::{MirrorLog, Target, TargetArea},
        units::Sectors,
    };

    use super::*;

    struct MockDev {
        name: DmNameBuf,
        uuid: Option<DmUuidBuf>,
        device: Device,
        suspended: bool,
        live_table: Option<Vec<TargetLine>>,
        inactive_table: Option<Vec<TargetLine>>,
        open_count: i32,
        event_nr: u32,
        deferred: bool,
    }

    impl MockDev {
        fn info(&self) -> DmInfo {
            DmInfo {
                exists: true,
                suspended: self.suspended,
                live_table: self.live_table.is_some(),
                inactive_table: self.inactive_table.is_some(),
                open_count: self.open_count,
                event_nr: self.event_nr,
                device: Some(self.device),
                read_only: false,
                target_count: self
                    .inactive_table
                    .as_ref()
                    .or(self.live_table.as_ref())
                    .map_or(0, |t| t.len() as u32),
            }
        }
    }

    /// A kernel boundary that records the operations issued to it.
    #[derive(Default)]
    struct MockDm {
        devs: Vec<MockDev>,
        ops: Vec<String>,
        next_minor: u32,
        fail_on: Option<String>,
    }

    impl MockDm {
        fn index_of(&self, id: &DevId<'_>) -> DmResult<usize> {
            self.devs
                .iter()
                .position(|d| match *id {
                    DevId::Name(name) => &*d.name == name,
                    DevId::Uuid(uuid) => d.uuid.as_deref() == Some(uuid),
                })
                .ok_or_else(|| {
                    DmError::Dm(ErrorEnum::NotFound, format!("no kernel device {id}"))
                })
        }

        fn check_fail(&self, op: &str) -> DmResult<()> {
            if self.fail_on.as_deref() == Some(op) {
                return Err(DmError::Dm(
                    ErrorEnum::Invalid,
                    format!("injected failure for {op}"),
                ));
            }
            Ok(())
        }

        fn set_open(&mut self, name: &str, count: i32) {
            self.devs
                .iter_mut()
                .find(|d| d.name.to_string() == name)
                .unwrap()
                .open_count = count;
        }
    }

    impl DmControl for MockDm {
        fn device_create(
            &mut self,
            name: &DmName,
            uuid: Option<&DmUuid>,
            _options: DmOptions,
        ) -> DmResult<DmInfo> {
            let op = format!("create {name}");
            self.check_fail(&op)?;
            if self.index_of(&DevId::Name(name)).is_ok() {
                return Err(DmError::Dm(
                    ErrorEnum::Invalid,
                    format!("device {name} already exists"),
                ));
            }

            let device = Device {
                major: 253,
                minor: self.next_minor,
            };
            self.next_minor += 1;
            self.devs.push(MockDev {
                name: name.to_owned(),
                uuid: uuid.map(|u| u.to_owned()),
                device,
                suspended: true,
                live_table: None,
                inactive_table: None,
                open_count: 0,
                event_nr: 0,
                deferred: false,
            });
            self.ops.push(op);
            Ok(self.devs.last().expect("just pushed").info())
        }

        fn device_remove(&mut self, id: &DevId<'_>, options: DmOptions) -> DmResult<DmInfo> {
            let idx = self.index_of(id)?;
            let op = format!("remove {}", self.devs[idx].name);
            self.check_fail(&op)?;

            if self.devs[idx].open_count > 0 {
                if options.has_flag(DmFlags::DM_DEFERRED_REMOVE) {
                    self.devs[idx].deferred = true;
                    self.ops.push(format!("{op} deferred"));
                    return Ok(self.devs[idx].info());
                }
                return Err(DmError::Dm(ErrorEnum::Busy, "device is open".into()));
            }

            let dev = self.devs.remove(idx);
            self.ops.push(op);
            Ok(dev.info())
        }

        fn device_rename(&mut self, old_name: &DmName, new: &DevId<'_>) -> DmResult<DmInfo> {
            let idx = self.index_of(&DevId::Name(old_name))?;
            if let DevId::Name(new_name) = new {
                self.devs[idx].name = (*new_name).to_owned();
            }
            self.ops.push(format!("rename {old_name} {new}"));
            Ok(self.devs[idx].info())
        }

        fn device_suspend(&mut self, id: &DevId<'_>, options: DmOptions) -> DmResult<DmInfo> {
            let idx = self.index_of(id)?;
            let name = self.devs[idx].name.to_string();

            if options.flags().contains(DmFlags::DM_SUSPEND) {
                let op = format!("suspend {name}");
                self.check_fail(&op)?;
                self.devs[idx].suspended = true;
                self.ops.push(if options.has_flag(DmFlags::DM_SKIP_LOCKFS) {
                    format!("{op} skip_lockfs")
                } else {
                    op
                });
            } else {
                let op = format!("resume {name}");
                self.check_fail(&op)?;
                let dev = &mut self.devs[idx];
                if let Some(table) = dev.inactive_table.take() {
                    dev.live_table = Some(table);
                    dev.event_nr += 1;
                }
                dev.suspended = false;
                self.ops.push(op);
            }

            Ok(self.devs[idx].info())
        }

        fn device_info(&mut self, id: &DevId<'_>) -> DmResult<DmInfo> {
            let idx = self.index_of(id)?;
            Ok(self.devs[idx].info())
        }

        fn table_load(
            &mut self,
            id: &DevId<'_>,
            targets: &[TargetLine],
            _options: DmOptions,
        ) -> DmResult<DmInfo> {
            let idx = self.index_of(id)?;
            let op = format!("load {}", self.devs[idx].name);
            self.check_fail(&op)?;
            self.devs[idx].inactive_table = Some(targets.to_vec());
            self.ops.push(op);
            Ok(self.devs[idx].info())
        }

        fn table_clear(&mut self, id: &DevId<'_>) -> DmResult<DmInfo> {
            let idx = self.index_of(id)?;
            self.devs[idx].inactive_table = None;
            self.ops.push(format!("clear {}", self.devs[idx].name));
            Ok(self.devs[idx].info())
        }
    }

    fn nb(s: &str) -> DmNameBuf {
        DmNameBuf::new(s.into()).unwrap()
    }

    fn ub(s: &str) -> DmUuidBuf {
        DmUuidBuf::new(s.into()).unwrap()
    }

    fn area(name: &str, uuid: &str, offset: u64) -> TargetArea {
        TargetArea::new(nb(name), ub(uuid), Sectors(offset))
    }

    fn linear_table(backing_name: &str, backing_uuid: &str, size: u64) -> TargetTable {
        let mut table = TargetTable::start().unwrap();
        table
            .add_entry(
                Sectors(size - 1),
                Target::linear(area(backing_name, backing_uuid, 0)),
            )
            .unwrap();
        table.complete().unwrap();
        table
    }

    fn mirror_table(size: u64) -> TargetTable {
        let mut table = TargetTable::start().unwrap();
        table
            .add_entry(
                Sectors(size - 1),
                Target::mirror(
                    MirrorLog::Core {
                        region_size: Sectors(1024),
                    },
                    vec![
                        area("lv_leg_a", "admin-leg-a", 0),
                        area("lv_leg_b", "admin-leg-b", 0),
                    ],
                )
                .unwrap(),
            )
            .unwrap();
        table.complete().unwrap();
        table
    }

    /// lv_top, a mirror over lv_leg_a and lv_leg_b, each linear over a
    /// physical device outside the admin- domain. Tables are staged in
    /// the inactive slots, ready to preload.
    fn stack_registry() -> DeviceRegistry {
        let mut registry = DeviceRegistry::new();
        registry.open_or_create(&nb("sda"), &ub("phys-a")).unwrap();
        registry.open_or_create(&nb("sdb"), &ub("phys-b")).unwrap();
        registry
            .set_device(
                &DevId::Name(&nb("sda")),
                Device {
                    major: 8,
                    minor: 16,
                },
            )
            .unwrap();
        registry
            .set_device(
                &DevId::Name(&nb("sdb")),
                Device {
                    major: 8,
                    minor: 32,
                },
            )
            .unwrap();

        registry
            .open_or_create(&nb("lv_leg_a"), &ub("admin-leg-a"))
            .unwrap();
        registry
            .open_or_create(&nb("lv_leg_b"), &ub("admin-leg-b"))
            .unwrap();
        registry
            .open_or_create(&nb("lv_top"), &ub("admin-top"))
            .unwrap();

        registry
            .set_table(
                &DevId::Name(&nb("lv_leg_a")),
                linear_table("sda", "phys-a", 2048),
                TableSlot::Inactive,
            )
            .unwrap();
        registry
            .set_table(
                &DevId::Name(&nb("lv_leg_b")),
                linear_table("sdb", "phys-b", 2048),
                TableSlot::Inactive,
            )
            .unwrap();
        registry
            .set_table(
                &DevId::Name(&nb("lv_top")),
                mirror_table(2048),
                TableSlot::Inactive,
            )
            .unwrap();

        registry
    }

    fn activated_stack() -> (DeviceRegistry, DmTree, MockDm) {
        let mut registry = stack_registry();
        let tree = DmTree::build(&registry).unwrap();
        let mut dm = MockDm::default();
        let report = tree
            .preload_children(DmTree::ROOT, "admin-", true, &mut registry, &mut dm)
            .unwrap();
        assert_eq!(report.status(), WalkStatus::Success);
        (registry, tree, dm)
    }

    fn disposition_of<'a>(report: &'a WalkReport, name: &str) -> &'a NodeDisposition {
        &report
            .reports()
            .iter()
            .find(|r| r.name.as_ref().map_or(false, |n| n.to_string() == name))
            .unwrap()
            .disposition
    }

    #[test]
    fn test_build_stack_structure() {
        let registry = stack_registry();
        let tree = DmTree::build(&registry).unwrap();

        // Root plus five devices.
        assert_eq!(tree.len(), 6);

        let top = tree.find_node_by_uuid(&ub("admin-top")).unwrap();
        let leg_a = tree.find_node_by_uuid(&ub("admin-leg-a")).unwrap();
        let leg_b = tree.find_node_by_uuid(&ub("admin-leg-b")).unwrap();
        let sda = tree.find_node(8, 16).unwrap();

        // The only parentless device hangs off the root.
        let root_children: Vec<_> = tree.children(DmTree::ROOT, false).collect();
        assert_eq!(root_children, vec![top]);
        assert_eq!(tree.num_children(DmTree::ROOT, false), 1);

        let top_children: Vec<_> = tree.children(top, false).collect();
        assert_eq!(top_children, vec![leg_a, leg_b]);
        assert_eq!(tree.num_children(top, false), 2);
        assert_eq!(tree.num_children(top, true), 0);

        assert_eq!(tree.children(leg_a, false).collect::<Vec<_>>(), vec![sda]);
        assert_eq!(tree.num_children(sda, false), 0);

        // Childless devices are parents of the root.
        assert_eq!(tree.num_children(DmTree::ROOT, true), 2);

        assert_eq!(tree.find_node(0, 0), Some(DmTree::ROOT));
        assert_eq!(tree.node(sda).unwrap().device().unwrap().major, 8);
    }

    #[test]
    fn test_duplicate_references_collapse_to_one_edge() {
        let mut registry = DeviceRegistry::new();
        registry.open_or_create(&nb("sda"), &ub("phys-a")).unwrap();
        registry.open_or_create(&nb("lv0"), &ub("admin-0")).unwrap();

        let mut table = TargetTable::start().unwrap();
        table
            .add_entry(Sectors(1023), Target::linear(area("sda", "phys-a", 0)))
            .unwrap();
        table
            .add_entry(Sectors(2047), Target::linear(area("sda", "phys-a", 1024)))
            .unwrap();
        table.complete().unwrap();
        registry
            .set_table(&DevId::Name(&nb("lv0")), table, TableSlot::Inactive)
            .unwrap();

        let tree = DmTree::build(&registry).unwrap();
        let lv0 = tree.find_node_by_uuid(&ub("admin-0")).unwrap();
        assert_eq!(tree.num_children(lv0, false), 1);
    }

    #[test]
    /// A mutual reference is rejected during build; no tree results.
    fn test_cycle_detection() {
        let mut registry = DeviceRegistry::new();
        registry.open_or_create(&nb("a"), &ub("uuid-a")).unwrap();
        registry.open_or_create(&nb("b"), &ub("uuid-b")).unwrap();
        registry
            .set_table(
                &DevId::Name(&nb("a")),
                linear_table("b", "uuid-b", 1024),
                TableSlot::Inactive,
            )
            .unwrap();
        registry
            .set_table(
                &DevId::Name(&nb("b")),
                linear_table("a", "uuid-a", 1024),
                TableSlot::Inactive,
            )
            .unwrap();

        assert_matches!(
            DmTree::build(&registry),
            Err(DmError::Dm(ErrorEnum::CyclicDependency, _))
        );
    }

    #[test]
    fn test_build_rejects_unknown_backing_device() {
        let mut registry = stack_registry();
        registry.remove(&DevId::Name(&nb("sda"))).unwrap();
        assert_matches!(
            DmTree::build(&registry),
            Err(DmError::Dm(ErrorEnum::NotFound, _))
        );
    }

    #[test]
    /// Preload realises and loads dependencies before their parents.
    fn test_preload_creates_dependencies_first() {
        let mut registry = stack_registry();
        let tree = DmTree::build(&registry).unwrap();
        let mut dm = MockDm::default();

        let report = tree
            .preload_children(DmTree::ROOT, "admin-", false, &mut registry, &mut dm)
            .unwrap();
        assert_eq!(report.status(), WalkStatus::Success);
        assert_eq!(
            dm.ops,
            vec![
                "create lv_leg_a",
                "load lv_leg_a",
                "create lv_leg_b",
                "load lv_leg_b",
                "create lv_top",
                "load lv_top",
            ]
        );

        // Tables are staged, not live.
        let info = registry.info(&DevId::Name(&nb("lv_top")));
        assert!(info.inactive_table);
        assert!(!info.live_table);
        assert!(info.device.is_some());
    }

    #[test]
    /// Resume runs children before parents; the top of the stack goes
    /// live last.
    fn test_activate_orders_children_before_parents() {
        let mut registry = stack_registry();
        let tree = DmTree::build(&registry).unwrap();
        let mut dm = MockDm::default();

        tree.preload_children(DmTree::ROOT, "admin-", false, &mut registry, &mut dm)
            .unwrap();
        dm.ops.clear();

        let report = tree
            .activate_children(DmTree::ROOT, "admin-", &mut registry, &mut dm)
            .unwrap();
        assert_eq!(report.status(), WalkStatus::Success);
        assert_eq!(
            dm.ops,
            vec!["resume lv_leg_a", "resume lv_leg_b", "resume lv_top"]
        );

        let info = registry.info(&DevId::Name(&nb("lv_top")));
        assert!(info.live_table);
        assert!(!info.inactive_table);
        assert!(!info.suspended);
    }

    #[test]
    /// Walks scoped to a foreign prefix touch nothing.
    fn test_scope_excludes_foreign_devices() {
        let mut registry = stack_registry();
        let tree = DmTree::build(&registry).unwrap();
        let mut dm = MockDm::default();

        let report = tree
            .preload_children(DmTree::ROOT, "zzz-", true, &mut registry, &mut dm)
            .unwrap();
        assert_eq!(report.status(), WalkStatus::Success);
        assert!(dm.ops.is_empty());
        assert!(report
            .reports()
            .iter()
            .all(|r| matches!(r.disposition, NodeDisposition::OutOfScope)));
    }

    #[test]
    /// Removal walks parents first; a busy leg is skipped with Busy
    /// while its sibling still goes, and the walk reports partial
    /// failure.
    fn test_deactivate_busy_leg() {
        let (mut registry, tree, mut dm) = activated_stack();
        dm.ops.clear();
        dm.set_open("lv_leg_a", 1);

        let report = tree
            .deactivate_children(DmTree::ROOT, "admin-", &mut registry, &mut dm)
            .unwrap();
        assert_eq!(report.status(), WalkStatus::PartialFailure);
        assert_eq!(dm.ops, vec!["remove lv_top", "remove lv_leg_b"]);

        assert_matches!(disposition_of(&report, "lv_top"), NodeDisposition::Done);
        assert_matches!(disposition_of(&report, "lv_leg_a"), NodeDisposition::Busy);
        assert_matches!(disposition_of(&report, "lv_leg_b"), NodeDisposition::Done);

        assert!(!registry.info(&DevId::Name(&nb("lv_top"))).exists);
        assert!(registry.info(&DevId::Name(&nb("lv_leg_a"))).exists);
        assert!(!registry.info(&DevId::Name(&nb("lv_leg_b"))).exists);
        // The foreign physical devices were not touched.
        assert!(registry.info(&DevId::Name(&nb("sda"))).exists);
    }

    #[test]
    /// With deferred removal requested, a busy device is handed to the
    /// kernel for removal on last close and the walk succeeds.
    fn test_deactivate_deferred_remove() {
        let (mut registry, tree, mut dm) = activated_stack();
        dm.ops.clear();
        dm.set_open("lv_leg_a", 1);
        registry
            .set_deferred_remove(&DevId::Name(&nb("lv_leg_a")), true)
            .unwrap();

        let report = tree
            .deactivate_children(DmTree::ROOT, "admin-", &mut registry, &mut dm)
            .unwrap();
        assert_eq!(report.status(), WalkStatus::Success);
        assert_matches!(
            disposition_of(&report, "lv_leg_a"),
            NodeDisposition::Deferred
        );
        assert!(dm.ops.contains(&"remove lv_leg_a deferred".to_string()));
        // The device itself stays until its last close.
        let leg = dm
            .devs
            .iter()
            .find(|d| d.name.to_string() == "lv_leg_a")
            .unwrap();
        assert!(leg.deferred);
    }

    #[test]
    /// Reloading a live device stages the new table without touching
    /// live I/O; the later resume promotes it and bumps the event
    /// counter by one.
    fn test_reload_then_resume() {
        let (mut registry, _, mut dm) = activated_stack();
        let top_name = nb("lv_top");
        let id = DevId::Name(&top_name);
        let event_before = registry.get(&id).unwrap().event_nr();

        registry
            .set_table(&id, mirror_table(4096), TableSlot::Inactive)
            .unwrap();
        let tree = DmTree::build(&registry).unwrap();
        let top = tree.find_node_by_uuid(&ub("admin-top")).unwrap();
        dm.ops.clear();

        let report = tree
            .preload_children(top, "admin-", false, &mut registry, &mut dm)
            .unwrap();
        assert_eq!(report.status(), WalkStatus::Success);
        // The device exists, so no create is issued.
        assert_eq!(dm.ops, vec!["load lv_top"]);
        assert!(registry.info(&id).inactive_table);

        let report = tree
            .activate_children(top, "admin-", &mut registry, &mut dm)
            .unwrap();
        assert_eq!(report.status(), WalkStatus::Success);
        assert_eq!(dm.ops, vec!["load lv_top", "resume lv_top"]);

        let record = registry.get(&id).unwrap();
        assert_eq!(record.event_nr(), event_before + 1);
        assert!(record.live_table().is_some());
        assert!(record.inactive_table().is_none());
    }

    #[test]
    /// Suspension walks parents first and requests the filesystem
    /// freeze only at the top of the stack.
    fn test_suspend_order_and_lockfs() {
        let (mut registry, tree, mut dm) = activated_stack();
        dm.ops.clear();

        let report = tree
            .suspend_children(DmTree::ROOT, "admin-", &mut registry, &mut dm)
            .unwrap();
        assert_eq!(report.status(), WalkStatus::Success);
        assert_eq!(
            dm.ops,
            vec![
                "suspend lv_top",
                "suspend lv_leg_a skip_lockfs",
                "suspend lv_leg_b skip_lockfs",
            ]
        );
        assert!(registry.info(&DevId::Name(&nb("lv_top"))).suspended);

        // A later activation clears the suspension, children first.
        dm.ops.clear();
        let report = tree
            .activate_children(DmTree::ROOT, "admin-", &mut registry, &mut dm)
            .unwrap();
        assert_eq!(report.status(), WalkStatus::Success);
        assert_eq!(
            dm.ops,
            vec!["resume lv_leg_a", "resume lv_leg_b", "resume lv_top"]
        );
        assert!(!registry.info(&DevId::Name(&nb("lv_top"))).suspended);
    }

    #[test]
    /// A failure halts the failed node's path; siblings continue, and
    /// the parent above the failure is blocked, not attempted.
    fn test_failure_blocks_path_but_not_siblings() {
        let mut registry = stack_registry();
        let tree = DmTree::build(&registry).unwrap();
        let mut dm = MockDm {
            fail_on: Some("load lv_leg_a".to_string()),
            ..Default::default()
        };

        let report = tree
            .preload_children(DmTree::ROOT, "admin-", false, &mut registry, &mut dm)
            .unwrap();
        assert_eq!(report.status(), WalkStatus::PartialFailure);

        assert_matches!(
            disposition_of(&report, "lv_leg_a"),
            NodeDisposition::Failed(_)
        );
        assert_matches!(disposition_of(&report, "lv_leg_b"), NodeDisposition::Done);
        assert_matches!(disposition_of(&report, "lv_top"), NodeDisposition::Blocked);

        // The blocked parent was never created.
        assert!(!dm.ops.iter().any(|op| op == "create lv_top"));
        assert!(dm.ops.iter().any(|op| op == "load lv_leg_b"));
    }

    #[test]
    /// Cancellation is checked at every node boundary; a walk
    /// cancelled up front issues nothing.
    fn test_cancellation() {
        let mut registry = stack_registry();
        let mut tree = DmTree::build(&registry).unwrap();
        let flag = Arc::new(AtomicBool::new(true));
        tree.set_cancel(Arc::clone(&flag));
        let mut dm = MockDm::default();

        let report = tree
            .preload_children(DmTree::ROOT, "admin-", false, &mut registry, &mut dm)
            .unwrap();
        assert_eq!(report.status(), WalkStatus::PartialFailure);
        assert!(dm.ops.is_empty());
        assert!(report
            .reports()
            .iter()
            .all(|r| matches!(r.disposition, NodeDisposition::Cancelled)));
    }

    #[test]
    fn test_children_use_uuid() {
        let registry = stack_registry();
        let tree = DmTree::build(&registry).unwrap();

        assert!(tree.children_use_uuid(DmTree::ROOT, "admin-"));
        assert!(tree.children_use_uuid(DmTree::ROOT, "phys-"));
        assert!(!tree.children_use_uuid(DmTree::ROOT, "zzz-"));

        let leg_a = tree.find_node_by_uuid(&ub("admin-leg-a")).unwrap();
        assert!(tree.children_use_uuid(leg_a, "phys-"));
        assert!(!tree.children_use_uuid(leg_a, "admin-"));

        let sda = tree.find_node(8, 16).unwrap();
        assert!(!tree.children_use_uuid(sda, "admin-"));
    }

    #[test]
    fn test_node_context() {
        let registry = stack_registry();
        let mut tree = DmTree::build(&registry).unwrap();
        let top = tree.find_node_by_uuid(&ub("admin-top")).unwrap();

        assert!(tree.node(top).unwrap().context().is_none());
        tree.set_context(top, Box::new(42u32)).unwrap();
        assert_eq!(
            tree.node(top)
                .unwrap()
                .context()
                .unwrap()
                .downcast_ref::<u32>(),
            Some(&42)
        );

        assert_matches!(
            tree.set_context(999, Box::new(())),
            Err(DmError::Dm(ErrorEnum::NotFound, _))
        );
    }

    #[test]
    /// After activation the tree can be rebuilt with device numbers
    /// populated, and nodes found by them.
    fn test_find_by_device_after_activation() {
        let (registry, _, _) = activated_stack();
        let tree = DmTree::build(&registry).unwrap();

        let top = tree.find_node_by_uuid(&ub("admin-top")).unwrap();
        let by_dev = tree.find_node(253, 2).unwrap();
        assert_eq!(top, by_dev);
    }
}
