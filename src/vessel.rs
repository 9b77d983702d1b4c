//! Vehicle topology snapshot: the external interface consumed from the
//! host application.
//!
//! A [`VesselSnapshot`] is a frozen description of the physical part
//! tree, its attach nodes, fuel lines, docking links and decoupler
//! modules, together with per-part resources and engine definitions.
//! The topology builder turns it into the simulation graph; nothing in
//! this module is mutated by the simulation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    arena::{Arena, IdLike},
    engine::{Engine, ResourceId},
    node::Resource,
};

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
pub struct PartId(pub u32);

impl IdLike for PartId {
    fn from_raw(index: usize) -> Self {
        Self(index as u32)
    }

    fn into_raw(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct VesselSnapshot {
    pub parts: Arena<PartId, Part>,
    pub root: PartId,
    /// Most recently activated stage at snapshot time. Stage indices
    /// descend toward 0.
    pub last_stage: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Part {
    pub name: String,
    pub parent: Option<PartId>,
    pub children: Vec<PartId>,
    /// Activation stage of this part and its modules.
    pub inverse_stage: i32,

    pub dry_mass: f64,
    pub crew_mass: f64,
    /// Module mass once this part's activation stage has passed.
    pub modules_staged_mass: f64,
    /// Module mass while this part is still unstaged.
    pub modules_unstaged_mass: f64,

    pub resources: HashMap<ResourceId, Resource>,
    /// Tie-break value for priority flow; higher drains first.
    pub resource_priority: i32,

    /// May resources flow through this part at all?
    pub fuel_crossfeed: bool,
    pub surface_mounted: bool,
    /// Resources that must never be drawn through the parent edge when
    /// this part is surface-mounted.
    pub blocked_from_parent: Vec<ResourceId>,
    /// Attach-node id substring that forbids crossfeed through the
    /// matching nodes (empty = none).
    pub no_crossfeed_node_key: String,
    pub attach_nodes: Vec<AttachNode>,

    /// Set when this part is a fuel line; the target gains a
    /// fuel-line-tagged crossfeed edge from this part.
    pub fuel_line_target: Option<PartId>,
    pub docking_node: Option<DockingNode>,
    pub decouplers: Vec<Decoupler>,

    pub is_launch_clamp: bool,
    /// Ignites even when physically disconnected (sepratron candidate).
    pub activates_even_if_disconnected: bool,
    pub engines: Vec<Engine>,
}

impl Part {
    pub fn is_engine(&self) -> bool {
        !self.engines.is_empty()
    }

    pub fn is_throttle_locked(&self) -> bool {
        self.engines.iter().any(|e| e.throttle_locked)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct AttachNode {
    pub id: String,
    pub attached: Option<PartId>,
    pub kind: AttachKind,
    /// Strut and other compound links never carry crossfeed.
    pub is_strut: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum AttachKind {
    #[default]
    Stack,
    Surface,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DockingNode {
    /// The opposite side of an in-flight docking link.
    pub partner: Option<PartId>,
    /// Docking nodes configured to stage sever the partner edge.
    pub staged: bool,
}

/// Decoupler-family module descriptors.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Decoupler {
    /// Severs the single neighbor on its explosive attach node.
    Anchored {
        staged: bool,
        attached: Option<PartId>,
    },
    /// Severs every attached neighbor (both-sided separator).
    Separator { staged: bool },
    /// Fairing panel; severs its own parent edge when jettisoned.
    Fairing { staged: bool },
}

impl Decoupler {
    pub fn staged(&self) -> bool {
        match *self {
            Decoupler::Anchored { staged, .. }
            | Decoupler::Separator { staged }
            | Decoupler::Fairing { staged } => staged,
        }
    }
}
