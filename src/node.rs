//! The per-segment simulation record.
//!
//! A [`FlowNode`] is the mutable state for one simulated vehicle part:
//! stored resources, the demand and drain accumulators recomputed every
//! step, the crossfeed edges it may draw through, and its staging data.

use std::{
    cmp,
    collections::{HashMap, HashSet},
    fmt,
};

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::{
    arena::IdLike,
    engine::{Conditions, Engine, FlowMode, ResourceId},
    MINIMUM_DETECTABLE_AMOUNT,
};

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
pub struct NodeId(pub u32);

impl IdLike for NodeId {
    fn from_raw(index: usize) -> Self {
        Self(index as u32)
    }

    fn into_raw(self) -> usize {
        self.0 as usize
    }
}

/// A stored resource on one segment.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Resource {
    /// Free resources (intake air) are treated as infinite and excluded
    /// from mass and depletion bookkeeping.
    pub free: bool,
    pub max_amount: f64,
    pub amount: f64,
    /// Density of the resource, in tons per unit.
    pub density: f64,
    /// Predicted maximum or actualized residuals of this resource, as
    /// a multiplier of [`Self::max_amount`].
    pub residual: f64,
}

impl Resource {
    pub fn residual_threshold(&self) -> f64 {
        cmp::max(
            OrderedFloat(MINIMUM_DETECTABLE_AMOUNT),
            OrderedFloat(self.residual * self.max_amount),
        )
        .0
    }

    pub fn drain(&mut self, resource_drain: f64) {
        self.amount -= resource_drain;
        if self.amount < 0.0 {
            self.amount = 0.0;
        }
    }
}

/// A crossfeed edge: `source` may supply resources to the owner of the
/// edge. Fuel-line edges take priority during stack-priority routing.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct CrossfeedEdge {
    pub source: NodeId,
    pub via_fuel_line: bool,
}

/// Sentinel for segments that never leave the vehicle.
pub const NEVER_DECOUPLED: i32 = -1;

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct FlowNode {
    pub name: String,

    pub resources: HashMap<ResourceId, Resource>,
    /// Demanded volumetric rate per resource at the current throttle
    /// and atmosphere, summed over this segment's engines.
    pub resource_consumptions: HashMap<ResourceId, f64>,
    /// Rate actually being withdrawn this step, accumulated by possibly
    /// several engines before being applied.
    pub resource_drains: HashMap<ResourceId, f64>,
    /// Vessel-wide flow rule per resource consumed here.
    pub propellant_flow_modes: HashMap<ResourceId, FlowMode>,
    pub engines: Vec<Engine>,
    /// Largest declared residual fraction over this segment's engines.
    pub engine_residuals: f64,

    pub crossfeed_sources: Vec<CrossfeedEdge>,
    /// Structural parent; relation only, carries no ownership.
    pub parent: Option<NodeId>,
    pub surface_mounted: bool,
    /// Resources that must never be drawn through the parent edge.
    pub blocked_from_parent: HashSet<ResourceId>,

    pub decoupled_in_stage: i32,
    pub inverse_stage: i32,
    pub is_engine: bool,
    pub is_throttle_locked: bool,
    pub is_sepratron: bool,
    pub is_launch_clamp: bool,
    pub resource_priority: i32,

    pub dry_mass: f64,
    pub crew_mass: f64,
    pub modules_staged_mass: f64,
    pub modules_unstaged_mass: f64,
}

impl FlowNode {
    /// Recomputes per-resource demand from this segment's engines at
    /// the given conditions.
    pub fn set_consumption_rates(&mut self, conditions: Conditions) {
        self.resource_consumptions.clear();
        self.propellant_flow_modes.clear();
        self.engine_residuals = 0.0;

        for engine in &mut self.engines {
            engine.update(conditions);
            self.engine_residuals = cmp::max(
                OrderedFloat(self.engine_residuals),
                OrderedFloat(engine.module_residuals),
            )
            .0;
        }
        for engine in &self.engines {
            for (id, mode) in engine.propellant_flow_modes() {
                self.propellant_flow_modes.insert(id, mode);
            }
            for (&id, &rate) in &engine.resource_consumptions {
                *self.resource_consumptions.entry(id).or_insert(0.0) += rate;
            }
        }
    }

    pub fn reset_drain_rates(&mut self) {
        self.resource_drains.clear();
    }

    pub fn add_drain(&mut self, res: ResourceId, rate: f64) {
        *self.resource_drains.entry(res).or_insert(0.0) += rate;
    }

    pub fn drain_rate(&self, res: ResourceId) -> f64 {
        self.resource_drains.get(&res).copied().unwrap_or(0.0)
    }

    /// Subtracts `rate * dt` from every non-free drained resource.
    pub fn drain_resources(&mut self, dt: f64) {
        for (id, drain) in &self.resource_drains {
            if let Some(resource) = self.resources.get_mut(id) {
                if !resource.free {
                    resource.drain(*drain * dt);
                }
            }
        }
    }

    /// Raises the recorded residual fraction of `res` to at least
    /// `residual`.
    pub fn raise_residual(&mut self, res: ResourceId, residual: f64) {
        if let Some(resource) = self.resources.get_mut(&res) {
            resource.residual =
                cmp::max(OrderedFloat(resource.residual), OrderedFloat(residual)).0;
        }
    }

    pub fn residual_threshold(&self, res: ResourceId) -> f64 {
        self.resources
            .get(&res)
            .map_or(0.0, Resource::residual_threshold)
    }

    /// May this segment itself supply `res`? Shared eligibility rule
    /// for `can_draw_needed_resources` and drain assignment. Free
    /// resources never qualify as drain targets.
    pub fn eligible(&self, res: ResourceId, engine_residual: f64) -> bool {
        self.resources.get(&res).is_some_and(|resource| {
            !resource.free
                && resource.amount
                    > cmp::max(
                        OrderedFloat(resource.residual_threshold()),
                        OrderedFloat(engine_residual * resource.max_amount),
                    )
                    .0
        })
    }

    /// Total mass in tons at the given simulation stage.
    pub fn mass(&self, sim_stage: i32) -> f64 {
        if self.is_launch_clamp {
            return 0.0;
        }

        let mut mass = self.dry_mass + self.crew_mass;
        mass += if sim_stage <= self.inverse_stage {
            self.modules_staged_mass
        } else {
            self.modules_unstaged_mass
        };
        for resource in self.resources.values() {
            if !resource.free {
                mass += resource.amount * resource.density;
            }
        }
        mass
    }

    /// The longest step that keeps every drained resource above its
    /// residual threshold; +inf when nothing here is draining.
    pub fn max_time_step(&self) -> f64 {
        let mut max_time = f64::INFINITY;

        for (res, resource) in &self.resources {
            if resource.free || resource.amount <= resource.residual_threshold() {
                continue;
            }
            if let Some(drain) = self.resource_drains.get(res) {
                if *drain > 0.0 {
                    let dt = (resource.amount - resource.residual_threshold()) / drain;
                    max_time = cmp::min(OrderedFloat(max_time), OrderedFloat(dt)).0;
                }
            }
        }

        max_time
    }
}

impl fmt::Display for FlowNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.name)?;
        write!(f, "  Resources:")?;
        for (id, resource) in &self.resources {
            write!(f, " {}={}/{}", id.0, resource.amount, resource.max_amount)?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "  DecoupledInStage: {} InverseStage: {}",
            self.decoupled_in_stage, self.inverse_stage
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{test_engine, Propellant};

    fn tank(amount: f64, max_amount: f64) -> FlowNode {
        let mut node = FlowNode {
            name: "tank".into(),
            dry_mass: 0.5,
            decoupled_in_stage: NEVER_DECOUPLED,
            ..FlowNode::default()
        };
        node.resources.insert(
            ResourceId(0),
            Resource {
                free: false,
                max_amount,
                amount,
                density: 0.005,
                residual: 0.0,
            },
        );
        node
    }

    #[test]
    fn mass_switches_module_variant_at_activation() {
        let mut node = tank(0.0, 100.0);
        node.inverse_stage = 2;
        node.modules_staged_mass = 0.1;
        node.modules_unstaged_mass = 0.4;

        // Stage 3 has not reached the segment's activation stage yet.
        assert!((node.mass(3) - 0.9).abs() < 1e-12);
        // From stage 2 downward the staged variant applies.
        assert!((node.mass(2) - 0.6).abs() < 1e-12);
        assert!((node.mass(0) - 0.6).abs() < 1e-12);
    }

    #[test]
    fn launch_clamp_mass_is_zero() {
        let mut node = tank(100.0, 100.0);
        node.is_launch_clamp = true;
        assert_eq!(node.mass(0), 0.0);
    }

    #[test]
    fn free_resources_carry_no_mass_and_never_drain() {
        let mut node = tank(100.0, 100.0);
        node.resources.insert(
            ResourceId(7),
            Resource {
                free: true,
                max_amount: 10.0,
                amount: 10.0,
                density: 0.005,
                residual: 0.0,
            },
        );
        assert!((node.mass(0) - (0.5 + 100.0 * 0.005)).abs() < 1e-12);

        node.add_drain(ResourceId(7), 1.0);
        node.drain_resources(5.0);
        assert_eq!(node.resources[&ResourceId(7)].amount, 10.0);
    }

    #[test]
    fn max_time_step_accounts_for_residuals() {
        let mut node = tank(100.0, 100.0);
        node.add_drain(ResourceId(0), 10.0);
        assert!((node.max_time_step() - 10.0).abs() < 1e-3);

        node.raise_residual(ResourceId(0), 0.1);
        assert!((node.max_time_step() - 9.0).abs() < 1e-9);
    }

    #[test]
    fn max_time_step_infinite_without_drains() {
        let node = tank(100.0, 100.0);
        assert_eq!(node.max_time_step(), f64::INFINITY);
    }

    #[test]
    fn drains_accumulate_and_apply() {
        let mut node = tank(100.0, 100.0);
        node.add_drain(ResourceId(0), 4.0);
        node.add_drain(ResourceId(0), 6.0);
        node.drain_resources(2.0);
        assert!((node.resources[&ResourceId(0)].amount - 80.0).abs() < 1e-12);

        node.reset_drain_rates();
        node.drain_resources(2.0);
        assert!((node.resources[&ResourceId(0)].amount - 80.0).abs() < 1e-12);
    }

    #[test]
    fn eligibility_respects_engine_residual_override() {
        let node = tank(8.0, 100.0);
        assert!(node.eligible(ResourceId(0), 0.0));
        // An engine declaring 10% residuals cannot see the last 10
        // units of a 100-unit tank.
        assert!(!node.eligible(ResourceId(0), 0.1));
    }

    #[test]
    fn consumption_rates_sum_over_engines() {
        let fuel = Propellant {
            id: ResourceId(0),
            ignore_for_isp: false,
            ratio: 1.0,
            flow_mode: FlowMode::StackPrioritySearch,
            density: 0.005,
        };
        let mut node = tank(100.0, 100.0);
        node.engines.push(test_engine(100.0, 300.0, vec![fuel]));
        node.engines.push(test_engine(100.0, 300.0, vec![fuel]));
        node.set_consumption_rates(Conditions {
            main_throttle: 1.0,
            ..Conditions::default()
        });

        let single = 100.0 / (300.0 * crate::G0) / 0.005;
        let total = node.resource_consumptions[&ResourceId(0)];
        assert!((total - 2.0 * single).abs() < 1e-9);
        assert_eq!(
            node.propellant_flow_modes[&ResourceId(0)],
            FlowMode::StackPrioritySearch
        );
    }
}
