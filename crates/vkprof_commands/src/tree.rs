//! Arena-allocated trees of recorded commands.

use crate::command::Command;

/// Index of a node in a [`CommandTree`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandNodeId(u32);

/// GPU timestamps at which a command or group started and finished
/// executing, in device ticks. A value of zero means no timestamp is
/// available.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CommandTimestamps {
    pub begin: u64,
    pub end: u64,
}

/// A command in a [`CommandTree`] together with its links to the rest of
/// the tree.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandNode {
    command: Command,
    parent: Option<CommandNodeId>,
    children: Vec<CommandNodeId>,
    profiled: bool,
    timestamps: Option<CommandTimestamps>,
}

/// Tree of recorded commands, with a [`Command::RootGroup`] at the root.
///
/// Nodes are owned by the tree and referred to by [`CommandNodeId`]s. The
/// children of a group are ordered as the commands were recorded, and a
/// node's parent never changes after insertion.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandTree {
    nodes: Vec<CommandNode>,
}

impl CommandNodeId {
    pub const ROOT: Self = Self(0);

    fn from_idx(idx: usize) -> Self {
        Self(u32::try_from(idx).expect("Command tree has too many nodes"))
    }

    fn idx(self) -> usize {
        self.0 as usize
    }
}

impl CommandTimestamps {
    pub fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    /// Returns the number of ticks between the begin and end timestamps, or
    /// zero if either is missing.
    pub fn duration_ticks(&self) -> u64 {
        if self.begin == 0 || self.end == 0 {
            0
        } else {
            self.end.saturating_sub(self.begin)
        }
    }
}

impl CommandNode {
    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn parent(&self) -> Option<CommandNodeId> {
        self.parent
    }

    pub fn children(&self) -> &[CommandNodeId] {
        &self.children
    }

    /// Whether timestamp queries were written around this command, or
    /// around all of the group's children for groups.
    pub fn is_profiled(&self) -> bool {
        self.profiled
    }

    /// Returns the resolved timestamps of the command, if any.
    pub fn timestamps(&self) -> Option<CommandTimestamps> {
        self.timestamps
    }
}

impl CommandTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![CommandNode {
                command: Command::RootGroup,
                parent: None,
                children: Vec::new(),
                profiled: false,
                timestamps: None,
            }],
        }
    }

    pub fn root(&self) -> &CommandNode {
        &self.nodes[0]
    }

    /// # Panics
    /// If the node does not exist in this tree.
    pub fn node(&self, id: CommandNodeId) -> &CommandNode {
        &self.nodes[id.idx()]
    }

    pub fn get(&self, id: CommandNodeId) -> Option<&CommandNode> {
        self.nodes.get(id.idx())
    }

    /// Returns the number of nodes in the tree, including the root.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the root has no children.
    pub fn is_empty(&self) -> bool {
        self.root().children.is_empty()
    }

    /// Appends a node for the given command as the last child of `parent`.
    ///
    /// # Panics
    /// - If `parent` does not exist in this tree.
    /// - If `parent` is not a group.
    /// - If `command` is a root group.
    pub fn push(&mut self, parent: CommandNodeId, command: Command, profiled: bool) -> CommandNodeId {
        assert!(
            self.node(parent).command.is_group(),
            "Tried to add child to non-group command {:?}",
            self.node(parent).command.kind()
        );
        assert!(
            !matches!(command, Command::RootGroup),
            "Tried to add root group as child"
        );

        let id = CommandNodeId::from_idx(self.nodes.len());
        self.nodes.push(CommandNode {
            command,
            parent: Some(parent),
            children: Vec::new(),
            profiled,
            timestamps: None,
        });
        self.nodes[parent.idx()].children.push(id);
        id
    }

    /// Copies the subtree rooted at `id` into `destination` as the last
    /// child of `destination_parent`, preserving the kinds, flags,
    /// timestamps and child order of every node. Returns the ID of the copy
    /// of the subtree root.
    ///
    /// # Panics
    /// If `id` is the root of this tree, or if `destination_parent` is not a
    /// group in `destination`.
    pub fn copy_subtree(
        &self,
        id: CommandNodeId,
        destination: &mut Self,
        destination_parent: CommandNodeId,
    ) -> CommandNodeId {
        let node = self.node(id);
        let copy_id = destination.push(destination_parent, node.command.clone(), node.profiled);
        destination.set_timestamps(copy_id, node.timestamps);

        for &child in &node.children {
            self.copy_subtree(child, destination, copy_id);
        }
        copy_id
    }

    /// Replaces the command of a node with one of the same kind.
    ///
    /// # Panics
    /// If the kinds differ.
    pub fn replace_command(&mut self, id: CommandNodeId, command: Command) {
        let node = &mut self.nodes[id.idx()];
        assert_eq!(
            node.command.kind(),
            command.kind(),
            "Tried to change kind of command node"
        );
        node.command = command;
    }

    pub fn set_profiled(&mut self, id: CommandNodeId, profiled: bool) {
        self.nodes[id.idx()].profiled = profiled;
    }

    pub fn set_timestamps(&mut self, id: CommandNodeId, timestamps: Option<CommandTimestamps>) {
        self.nodes[id.idx()].timestamps = timestamps;
    }

    /// Returns the IDs of all nodes below the root in depth-first pre-order,
    /// which is the order the commands were recorded in.
    pub fn depth_first(&self) -> impl Iterator<Item = CommandNodeId> + '_ {
        let mut stack: Vec<CommandNodeId> = self.root().children.iter().rev().copied().collect();
        std::iter::from_fn(move || {
            let id = stack.pop()?;
            stack.extend(self.node(id).children.iter().rev());
            Some(id)
        })
    }

    /// Returns the non-group commands in the order they were recorded.
    pub fn leaves(&self) -> impl Iterator<Item = &CommandNode> + '_ {
        self.depth_first()
            .map(|id| self.node(id))
            .filter(|node| !node.command.is_group())
    }
}

impl Default for CommandTree {
    fn default() -> Self {
        Self::new()
    }
}
