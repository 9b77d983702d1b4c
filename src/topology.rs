//! Builds the simulation graph from a [`VesselSnapshot`].
//!
//! This is where all the vehicle-structure analysis happens: snapshot
//! validation, crossfeed edge derivation from attach nodes, fuel lines
//! and docking links, and the decoupled-in-stage assignment that
//! decides which segments leave the vehicle at which stage.

use std::collections::{HashMap, HashSet};

use color_eyre::eyre::{bail, Result};
use tracing::trace;

use crate::{
    arena::IdLike,
    engine::ResourceId,
    node::{CrossfeedEdge, FlowNode, NodeId, NEVER_DECOUPLED},
    sim::SimVessel,
    vessel::{AttachKind, Decoupler, Part, PartId, VesselSnapshot},
};

/// Turns a snapshot into a live [`SimVessel`] plus the starting
/// simulation stage (one above the highest stage any part activates
/// in).
pub fn build(snapshot: &VesselSnapshot) -> Result<(SimVessel, i32)> {
    validate(snapshot)?;

    let decoupled_in_stage = assign_decoupled_in_stage(snapshot);

    let mut vessel = SimVessel::default();
    for (id, part) in snapshot.parts.iter() {
        let node = build_node(part, decoupled_in_stage[&id]);
        trace!(%node, "built segment");
        let node_id = vessel.nodes.push(node);
        vessel.active.push(node_id);
    }
    add_crossfeed_edges(snapshot, &mut vessel);

    let mut sim_stage = snapshot.last_stage;
    for (_, part) in snapshot.parts.iter() {
        sim_stage = sim_stage.max(part.inverse_stage);
    }
    Ok((vessel, sim_stage + 1))
}

/// Every part reference in the snapshot must resolve, and every
/// blocked-from-parent resource id must be one the vehicle actually
/// knows about.
fn validate(snapshot: &VesselSnapshot) -> Result<()> {
    let parts = &snapshot.parts;
    if !parts.contains(snapshot.root) {
        bail!("root part {} is not in the snapshot", snapshot.root.0);
    }

    let mut known_resources: HashSet<ResourceId> = HashSet::new();
    for (_, part) in parts.iter() {
        known_resources.extend(part.resources.keys().copied());
        for engine in &part.engines {
            known_resources.extend(engine.propellants.iter().map(|p| p.id));
        }
    }

    for (_, part) in parts.iter() {
        let check = |id: Option<PartId>, what: &str| -> Result<()> {
            if let Some(id) = id {
                if !parts.contains(id) {
                    bail!("part '{}' has a dangling {what} reference", part.name);
                }
            }
            Ok(())
        };

        check(part.parent, "parent")?;
        check(part.fuel_line_target, "fuel line target")?;
        for &child in &part.children {
            check(Some(child), "child")?;
        }
        for attach in &part.attach_nodes {
            check(attach.attached, "attach node")?;
        }
        if let Some(docking) = part.docking_node {
            check(docking.partner, "docking partner")?;
        }
        for decoupler in &part.decouplers {
            if let Decoupler::Anchored { attached, .. } = *decoupler {
                check(attached, "decoupler anchor")?;
            }
        }

        for res in &part.blocked_from_parent {
            if !known_resources.contains(res) {
                bail!(
                    "part '{}' blocks unknown resource {} from its parent",
                    part.name,
                    res.0
                );
            }
        }
    }

    Ok(())
}

fn build_node(part: &Part, decoupled_in_stage: i32) -> FlowNode {
    let is_sepratron = part.is_engine()
        && part.is_throttle_locked()
        && part.activates_even_if_disconnected
        && part.inverse_stage == decoupled_in_stage;

    FlowNode {
        name: part.name.clone(),
        resources: part.resources.clone(),
        engines: part.engines.clone(),
        parent: part.parent.map(|p| NodeId::from_raw(p.into_raw())),
        surface_mounted: part.surface_mounted,
        blocked_from_parent: part.blocked_from_parent.iter().copied().collect(),
        decoupled_in_stage,
        inverse_stage: part.inverse_stage,
        is_engine: part.is_engine(),
        is_throttle_locked: part.is_throttle_locked(),
        is_sepratron,
        is_launch_clamp: part.is_launch_clamp,
        resource_priority: part.resource_priority,
        dry_mass: part.dry_mass,
        crew_mass: part.crew_mass,
        modules_staged_mass: part.modules_staged_mass,
        modules_unstaged_mass: part.modules_unstaged_mass,
        ..FlowNode::default()
    }
}

/// Derives directed supply edges. Fuel lines always feed their target;
/// stack attach nodes and docking links feed both ways when both sides
/// permit crossfeed; the structural parent feeds a surface-mounted
/// child directly, subject to the child's blocked-resource list at
/// resolve time.
fn add_crossfeed_edges(snapshot: &VesselSnapshot, vessel: &mut SimVessel) {
    let parts = &snapshot.parts;
    let node_of = |p: PartId| NodeId::from_raw(p.into_raw());

    // Fuel lines first so they survive deduplication with their tag.
    for (id, part) in parts.iter() {
        if let Some(target) = part.fuel_line_target {
            add_edge(vessel, node_of(target), node_of(id), true);
        }
    }

    for (id, part) in parts.iter() {
        if !part.fuel_crossfeed {
            continue;
        }

        for attach in &part.attach_nodes {
            let Some(other) = attach.attached else {
                continue;
            };
            if attach.kind != AttachKind::Stack
                || attach.is_strut
                || !parts[other].fuel_crossfeed
                || link_forbidden(part, &attach.id, &parts[other], id)
            {
                continue;
            }
            add_edge(vessel, node_of(id), node_of(other), false);
            add_edge(vessel, node_of(other), node_of(id), false);
        }

        if part.surface_mounted {
            if let Some(parent) = part.parent {
                if parts[parent].fuel_crossfeed {
                    add_edge(vessel, node_of(id), node_of(parent), false);
                }
            }
        }

        if let Some(partner) = part.docking_node.and_then(|d| d.partner) {
            if parts[partner].fuel_crossfeed {
                add_edge(vessel, node_of(id), node_of(partner), false);
                add_edge(vessel, node_of(partner), node_of(id), false);
            }
        }
    }
}

fn crossfeed_forbidden(part: &Part, attach_id: &str) -> bool {
    !part.no_crossfeed_node_key.is_empty() && attach_id.contains(&part.no_crossfeed_node_key)
}

/// A stack link is blocked when either endpoint forbids crossfeed on
/// its own attach node of the joint.
fn link_forbidden(part: &Part, attach_id: &str, other: &Part, part_id: PartId) -> bool {
    crossfeed_forbidden(part, attach_id)
        || other.attach_nodes.iter().any(|back| {
            back.attached == Some(part_id) && crossfeed_forbidden(other, &back.id)
        })
}

fn add_edge(vessel: &mut SimVessel, dst: NodeId, source: NodeId, via_fuel_line: bool) {
    if dst == source {
        return;
    }
    let edges = &mut vessel.nodes[dst].crossfeed_sources;
    if edges.iter().any(|e| e.source == source) {
        return;
    }
    edges.push(CrossfeedEdge {
        source,
        via_fuel_line,
    });
}

/// Walks the part tree from the root, assigning the stage each part
/// leaves the vehicle in.
///
/// A staged decoupler module severs one or more edges at the module's
/// activation stage: severing the edge back toward the root drops the
/// carrying part and its whole subtree, severing any other edge drops
/// only the subtree beyond it. Launch clamps always release at their
/// own activation stage.
fn assign_decoupled_in_stage(snapshot: &VesselSnapshot) -> HashMap<PartId, i32> {
    let mut stages = HashMap::new();
    visit(
        snapshot,
        snapshot.root,
        None,
        NEVER_DECOUPLED,
        &mut stages,
    );
    // Parts unreachable from the root (detached debris) never matter
    // for the remaining burn.
    for (id, _) in snapshot.parts.iter() {
        stages.entry(id).or_insert(NEVER_DECOUPLED);
    }
    stages
}

fn visit(
    snapshot: &VesselSnapshot,
    id: PartId,
    incoming: Option<PartId>,
    inherited: i32,
    stages: &mut HashMap<PartId, i32>,
) {
    if stages.contains_key(&id) {
        return;
    }
    let part = &snapshot.parts[id];

    let mut own = inherited;
    let mut severed: HashMap<PartId, i32> = HashMap::new();

    for decoupler in &part.decouplers {
        if !decoupler.staged() {
            continue;
        }
        match *decoupler {
            Decoupler::Anchored { attached, .. } => {
                if attached == incoming {
                    own = part.inverse_stage;
                } else if let Some(other) = attached {
                    severed.insert(other, part.inverse_stage);
                }
            }
            Decoupler::Separator { .. } => {
                // Both sides separate; the root side keeps flying.
                own = part.inverse_stage;
                for neighbor in neighbors(part) {
                    if Some(neighbor) != incoming {
                        severed.insert(neighbor, part.inverse_stage);
                    }
                }
            }
            Decoupler::Fairing { .. } => {
                own = part.inverse_stage;
            }
        }
    }

    if let Some(docking) = part.docking_node {
        if docking.staged {
            if let Some(partner) = docking.partner {
                severed.insert(partner, part.inverse_stage);
            }
        }
    }

    if part.is_launch_clamp {
        own = part.inverse_stage;
    }

    stages.insert(id, own);

    for neighbor in neighbors(part) {
        let next = severed.get(&neighbor).copied().unwrap_or(own);
        visit(snapshot, neighbor, Some(id), next, stages);
    }
}

fn neighbors(part: &Part) -> impl Iterator<Item = PartId> + '_ {
    part.children
        .iter()
        .copied()
        .chain(part.parent)
        .chain(part.docking_node.and_then(|d| d.partner))
}
