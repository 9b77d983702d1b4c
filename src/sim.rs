//! Stage-by-stage fuel flow simulation.
//!
//! [`SimVessel`] holds the active segment graph and implements the
//! resource flow resolver; [`FuelFlowSimulation`] drives stage
//! activation, time stepping and the staging-permission decision, and
//! produces one [`Stats`] record per stage.

use std::{cmp, collections::HashSet, fmt};

use color_eyre::eyre::{bail, Result};
use itertools::Itertools;
use nalgebra::Vector3;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    arena::{Arena, IdSet},
    engine::{Conditions, FlowMode, ResourceId},
    node::{FlowNode, NodeId},
    topology, vessel, G0,
};

/// Per-stage performance statistics.
#[derive(Copy, Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Stats {
    /// Mass before the stage burns (tons)
    pub start_mass: f64,
    /// Mass when the stage may be dropped (tons)
    pub end_mass: f64,
    /// Thrust at stage start (kN)
    pub start_thrust: f64,
    /// Maximum acceleration over the stage (m/s^2)
    pub max_accel: f64,
    /// Burn time of the stage (s)
    pub delta_time: f64,
    /// Delta-v from the stage (m/s)
    pub deltav: f64,
    /// Maximum engine spool-up time seen in the stage (s)
    pub spool_up_time: f64,
}

impl Stats {
    /// Thrust-to-weight ratio at stage start.
    pub fn start_twr(&self, gee_asl: f64) -> f64 {
        if self.start_mass > 0.0 {
            self.start_thrust / (G0 * gee_asl * self.start_mass)
        } else {
            0.0
        }
    }

    /// Maximum thrust-to-weight ratio over the stage.
    pub fn max_twr(&self, gee_asl: f64) -> f64 {
        self.max_accel / (G0 * gee_asl)
    }

    /// Time-ordered associative combine: `self` happens first, `next`
    /// immediately after.
    pub fn merge(self, next: Stats) -> Stats {
        Stats {
            start_mass: self.start_mass,
            end_mass: next.end_mass,
            start_thrust: self.start_thrust,
            max_accel: cmp::max(OrderedFloat(self.max_accel), OrderedFloat(next.max_accel)).0,
            delta_time: self.delta_time + next.delta_time,
            deltav: self.deltav + next.deltav,
            spool_up_time: cmp::max(
                OrderedFloat(self.spool_up_time),
                OrderedFloat(next.spool_up_time),
            )
            .0,
        }
    }
}

/// The live simulation graph: every segment ever built plus the set
/// still attached at the current stage.
#[derive(Clone, Debug, Default)]
pub struct SimVessel {
    pub nodes: Arena<NodeId, FlowNode>,
    /// Segments still attached; shrinks monotonically as stages fire.
    pub active: Vec<NodeId>,
    /// Engine segments currently able to burn.
    pub active_engines: Vec<NodeId>,
    /// Segments that received a drain this step.
    drained: HashSet<NodeId>,

    pub mass: f64,
    pub thrust_current: Vector3<f64>,
    pub thrust_magnitude: f64,
    pub thrust_no_cos_loss: f64,
    pub spoolup_current: f64,
    pub conditions: Conditions,
}

impl SimVessel {
    pub fn update_mass(&mut self, sim_stage: i32) {
        self.mass = 0.0;
        for &id in &self.active {
            self.mass += self.nodes[id].mass(sim_stage);
        }
    }

    pub fn set_consumption_rates(&mut self) {
        let conditions = self.conditions;
        for &id in &self.active {
            self.nodes[id].set_consumption_rates(conditions);
        }
    }

    pub fn reset_drain_rates(&mut self) {
        let drained: Vec<NodeId> = self.drained.drain().collect();
        for id in drained {
            self.nodes[id].reset_drain_rates();
        }
    }

    pub fn drain_resources(&mut self, dt: f64) {
        for &id in &self.drained {
            self.nodes[id].drain_resources(dt);
        }
    }

    /// The longest time step that keeps every draining segment above
    /// its residual threshold.
    pub fn max_time_step(&self) -> f64 {
        let mut max_time = f64::INFINITY;
        for &id in &self.drained {
            max_time = cmp::min(
                OrderedFloat(max_time),
                OrderedFloat(self.nodes[id].max_time_step()),
            )
            .0;
        }
        max_time
    }

    /// Recomputes the set of engine segments that are activated at
    /// `sim_stage`, are actually flowing propellant, and can currently
    /// draw all of it. Zero-flow engines (throttle 0) burn nothing and
    /// must not hold up staging.
    pub fn find_active_engines(&mut self, sim_stage: i32) {
        let engines: Vec<NodeId> = self
            .active
            .iter()
            .copied()
            .filter(|&id| {
                let node = &self.nodes[id];
                node.is_engine
                    && node.inverse_stage >= sim_stage
                    && node.engines.iter().any(|e| e.mass_flow_rate > 0.0)
            })
            .filter(|&id| self.can_draw_needed_resources(id))
            .collect();
        self.active_engines = engines;
        self.compute_thrust_and_spoolup();
    }

    fn compute_thrust_and_spoolup(&mut self) {
        self.thrust_current = Vector3::zeros();
        self.thrust_no_cos_loss = 0.0;
        self.spoolup_current = 0.0;

        for &id in &self.active_engines {
            for engine in &self.nodes[id].engines {
                let norm = engine.thrust_current.norm();
                self.spoolup_current += norm * engine.module_spoolup_time;
                self.thrust_current += engine.thrust_current;
                self.thrust_no_cos_loss += norm;
            }
        }

        self.thrust_magnitude = self.thrust_current.norm();
        if self.thrust_no_cos_loss > 0.0 {
            self.spoolup_current /= self.thrust_no_cos_loss;
        } else {
            self.spoolup_current = 0.0;
        }
    }

    /// Can every propellant demanded by the engines on `id` be drawn
    /// under its flow mode? Must stay congruent with
    /// [`Self::assign_resource_drain_rates`].
    pub fn can_draw_needed_resources(&self, id: NodeId) -> bool {
        use FlowMode::{
            AllVessel, AllVesselBalance, NoFlow, Null, StackPrioritySearch, StagePriorityFlow,
            StagePriorityFlowBalance, StageStackFlow, StageStackFlowBalance,
        };
        let node = &self.nodes[id];
        let residual = node.engine_residuals;

        for &res in node.resource_consumptions.keys() {
            let mode = node
                .propellant_flow_modes
                .get(&res)
                .copied()
                .unwrap_or(Null);
            match mode {
                NoFlow => {
                    if !node.eligible(res, residual) {
                        return false;
                    }
                }
                AllVessel | AllVesselBalance | StagePriorityFlow | StagePriorityFlowBalance => {
                    if !self
                        .active
                        .iter()
                        .any(|&p| self.nodes[p].eligible(res, residual))
                    {
                        return false;
                    }
                }
                StackPrioritySearch | StageStackFlow | StageStackFlowBalance => {
                    let mut visited = IdSet::with_capacity(self.nodes.len());
                    if !self.can_supply_recursive(id, res, residual, &mut visited) {
                        return false;
                    }
                }
                Null => return false,
            }
        }

        true
    }

    /// Depth-first reachability of a supplier through the crossfeed
    /// graph. `visited` guards against docking-ring cycles.
    fn can_supply_recursive(
        &self,
        id: NodeId,
        res: ResourceId,
        residual: f64,
        visited: &mut IdSet<NodeId>,
    ) -> bool {
        visited.insert(id);
        let node = &self.nodes[id];
        if node.eligible(res, residual) {
            return true;
        }

        for edge in &node.crossfeed_sources {
            if visited.contains(edge.source) || edge_blocked(node, edge.source, edge.via_fuel_line, res) {
                continue;
            }
            if self.can_supply_recursive(edge.source, res, residual, visited) {
                return true;
            }
        }
        false
    }

    /// Routes the demand of every propellant consumed by the engines
    /// on `id` onto the graph, accumulating drain rates.
    pub fn assign_resource_drain_rates(&mut self, id: NodeId) {
        use FlowMode::{
            AllVessel, AllVesselBalance, NoFlow, Null, StackPrioritySearch, StagePriorityFlow,
            StagePriorityFlowBalance, StageStackFlow, StageStackFlowBalance,
        };
        let node = &self.nodes[id];
        let residual = node.engine_residuals;
        let demands: Vec<(ResourceId, f64, FlowMode)> = node
            .resource_consumptions
            .iter()
            .map(|(&res, &rate)| {
                (
                    res,
                    rate,
                    node.propellant_flow_modes
                        .get(&res)
                        .copied()
                        .unwrap_or(Null),
                )
            })
            .collect();

        for (res, rate, mode) in demands {
            match mode {
                NoFlow => {
                    self.nodes[id].raise_residual(res, residual);
                    if self.nodes[id].eligible(res, residual) {
                        self.add_drain(id, res, rate);
                    }
                }
                // STAGE_PRIORITY_FLOW and ALL_VESSEL share one
                // assignment path, as the host game does.
                AllVessel | AllVesselBalance | StagePriorityFlow | StagePriorityFlowBalance => {
                    self.assign_drain_priority(res, rate, residual);
                }
                StackPrioritySearch | StageStackFlow | StageStackFlowBalance => {
                    let mut visited = IdSet::with_capacity(self.nodes.len());
                    self.assign_drain_recursive(id, res, rate, residual, &mut visited);
                }
                Null => {}
            }
        }
    }

    /// Vessel-wide assignment: raise residual predictions on every
    /// possible supplier, then split the demand evenly over the
    /// suppliers sharing the highest resource priority.
    fn assign_drain_priority(&mut self, res: ResourceId, rate: f64, residual: f64) {
        let active = self.active.clone();
        let mut max_priority = i32::MIN;
        let mut sources: Vec<NodeId> = Vec::new();

        for &p in &active {
            if self.nodes[p].resources.contains_key(&res) {
                self.nodes[p].raise_residual(res, residual);
            }
            if !self.nodes[p].eligible(res, residual) {
                continue;
            }

            let priority = self.nodes[p].resource_priority;
            if priority < max_priority {
                continue;
            }
            if priority > max_priority {
                sources.clear();
                max_priority = priority;
            }
            sources.push(p);
        }

        if sources.is_empty() {
            return;
        }
        let split = rate / sources.len() as f64;
        for p in sources {
            self.add_drain(p, res, split);
        }
    }

    /// Stack-priority routing. Fuel-line edges are preferred and split
    /// the demand evenly; otherwise the first other edge that can
    /// supply absorbs all of it; the segment itself is the base case.
    fn assign_drain_recursive(
        &mut self,
        id: NodeId,
        res: ResourceId,
        rate: f64,
        residual: f64,
        visited: &mut IdSet<NodeId>,
    ) {
        visited.insert(id);
        let edges = self.nodes[id].crossfeed_sources.clone();

        let mut fuel_lines: Vec<NodeId> = Vec::new();
        for edge in &edges {
            if !edge.via_fuel_line || visited.contains(edge.source) {
                continue;
            }
            let mut probe = visited.clone();
            if self.can_supply_recursive(edge.source, res, residual, &mut probe) {
                fuel_lines.push(edge.source);
            }
        }
        if !fuel_lines.is_empty() {
            let split = rate / fuel_lines.len() as f64;
            for source in fuel_lines {
                let mut branch = visited.clone();
                self.assign_drain_recursive(source, res, split, residual, &mut branch);
            }
            return;
        }

        for edge in &edges {
            if edge.via_fuel_line || visited.contains(edge.source) {
                continue;
            }
            if edge_blocked(&self.nodes[id], edge.source, edge.via_fuel_line, res) {
                continue;
            }
            let mut probe = visited.clone();
            if self.can_supply_recursive(edge.source, res, residual, &mut probe) {
                self.assign_drain_recursive(edge.source, res, rate, residual, visited);
                return;
            }
        }

        if self.nodes[id].eligible(res, residual) {
            self.nodes[id].raise_residual(res, residual);
            self.add_drain(id, res, rate);
        }
    }

    fn add_drain(&mut self, id: NodeId, res: ResourceId, rate: f64) {
        self.nodes[id].add_drain(res, rate);
        self.drained.insert(id);
    }
}

impl fmt::Display for SimVessel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "mass: {} thrust: {} ({} segments, {} burning)",
            self.mass,
            self.thrust_magnitude,
            self.active.len(),
            self.active_engines.len()
        )?;
        for &id in &self.active {
            write!(f, "{}", self.nodes[id])?;
        }
        Ok(())
    }
}

/// May `node` draw `res` through the edge to `source`?
fn edge_blocked(node: &FlowNode, source: NodeId, via_fuel_line: bool, res: ResourceId) -> bool {
    !via_fuel_line
        && node.surface_mounted
        && node.parent == Some(source)
        && node.blocked_from_parent.contains(&res)
}

/// Per-stage iteration budget; exceeding it means the resource graph
/// does not converge and the run is unsimulable.
const MAX_STEPS_PER_STAGE: usize = 100;

/// The staged time-stepped integration loop.
#[derive(Clone, Debug)]
pub struct FuelFlowSimulation {
    pub vessel: SimVessel,
    /// Current simulation stage; strictly decreasing.
    pub sim_stage: i32,
    /// Simulated clock, seconds since the run started.
    pub time: f64,
    /// Use the cosine-loss-corrected thrust magnitude for delta-v
    /// instead of the scalar sum.
    pub dv_linear_thrust: bool,
}

impl FuelFlowSimulation {
    /// Builds the simulation graph from a topology snapshot.
    pub fn new(snapshot: &vessel::VesselSnapshot) -> Result<Self> {
        let (vessel, sim_stage) = topology::build(snapshot)?;
        Ok(Self {
            vessel,
            sim_stage,
            time: 0.0,
            dv_linear_thrust: true,
        })
    }

    /// Runs every remaining stage to completion and returns one
    /// [`Stats`] record per stage, highest stage first.
    pub fn simulate_all_stages(&mut self, conditions: Conditions) -> Result<Vec<Stats>> {
        let mut stages = Vec::new();
        self.vessel.conditions = conditions;
        self.time = 0.0;

        while self.sim_stage > 0 {
            self.activate_next_stage();
            debug!(stage = self.sim_stage, "activating stage");
            stages.push(self.simulate_stage()?);
        }

        Ok(stages)
    }

    /// Decrements the stage counter and drops every segment decoupled
    /// in the new stage, pruning their crossfeed edges everywhere.
    pub fn activate_next_stage(&mut self) {
        self.sim_stage -= 1;
        let stage = self.sim_stage;

        let mut removed: IdSet<NodeId> = IdSet::with_capacity(self.vessel.nodes.len());
        let mut any_removed = false;
        for &id in &self.vessel.active {
            if self.vessel.nodes[id].decoupled_in_stage == stage {
                removed.insert(id);
                any_removed = true;
            }
        }
        if !any_removed {
            return;
        }

        self.vessel.active.retain(|&id| !removed.contains(id));
        for (_, node) in self.vessel.nodes.iter_mut() {
            node.crossfeed_sources
                .retain(|edge| !removed.contains(edge.source));
        }
    }

    /// Burns the current stage until staging is permitted, combining
    /// each step's stats. Exceeding the iteration budget is fatal.
    pub fn simulate_stage(&mut self) -> Result<Stats> {
        self.update_vessel_state();
        let mut stats = self.initial_stats();

        for i in 0..MAX_STEPS_PER_STAGE {
            self.update_vessel_state();
            if self.allowed_to_stage() {
                return Ok(stats);
            }
            let step = self.simulate_time_step(f64::INFINITY);
            trace!(
                stage = self.sim_stage,
                iteration = i,
                dt = step.delta_time,
                time = self.time,
                "time step"
            );
            stats = stats.merge(step);
        }

        bail!(
            "stage {} did not converge after {MAX_STEPS_PER_STAGE} steps: \
             the resource graph cannot be simulated",
            self.sim_stage
        )
    }

    /// A single integration step of at most `desired_dt` seconds.
    pub fn simulate_time_step(&mut self, desired_dt: f64) -> Stats {
        self.update_vessel_state();

        let start_mass = self.vessel.mass;
        let start_thrust = self.current_thrust();
        let spool_up_time = self.vessel.spoolup_current;

        let dt = if self.vessel.active_engines.is_empty() {
            0.0
        } else {
            let engines = self.vessel.active_engines.clone();
            for id in engines {
                self.vessel.assign_resource_drain_rates(id);
            }
            let mut dt = desired_dt.min(self.vessel.max_time_step());
            if !dt.is_finite() || dt < 0.0 {
                dt = 0.0;
            }
            self.vessel.drain_resources(dt);
            dt
        };

        self.vessel.update_mass(self.sim_stage);
        let end_mass = self.vessel.mass;

        let deltav = if start_mass > end_mass && end_mass > 0.0 {
            start_thrust * dt / (start_mass - end_mass) * libm::log(start_mass / end_mass)
        } else {
            0.0
        };
        let max_accel = if end_mass > 0.0 {
            start_thrust / end_mass
        } else {
            0.0
        };

        self.time += dt;

        Stats {
            start_mass,
            end_mass,
            start_thrust,
            max_accel,
            delta_time: dt,
            deltav,
            spool_up_time,
        }
    }

    /// The staging-permission decision.
    ///
    /// Staging is always allowed with no engine burning; forbidden when
    /// it would drop a non-sepratron segment that is an active engine
    /// or still holds propellant an active engine burns; forbidden when
    /// it would drop nothing at all while an engine can still draw; and
    /// forbidden on the terminal stage while engines remain able to
    /// burn.
    pub fn allowed_to_stage(&self) -> bool {
        let vessel = &self.vessel;
        if vessel.active_engines.is_empty() {
            return true;
        }

        let next = self.sim_stage - 1;
        let burned: Vec<ResourceId> = vessel
            .active_engines
            .iter()
            .flat_map(|&id| vessel.nodes[id].resource_consumptions.keys().copied())
            .unique()
            .collect();

        let mut decouples_anything = false;
        for &id in &vessel.active {
            let node = &vessel.nodes[id];
            if node.decoupled_in_stage != next {
                continue;
            }
            decouples_anything = true;
            if node.is_sepratron {
                continue;
            }
            if vessel.active_engines.contains(&id) {
                return false;
            }
            if burned.iter().any(|&res| node.eligible(res, 0.0)) {
                return false;
            }
        }

        if !decouples_anything
            && vessel
                .active_engines
                .iter()
                .any(|&id| vessel.can_draw_needed_resources(id))
        {
            return false;
        }

        self.sim_stage > 0
    }

    fn update_vessel_state(&mut self) {
        self.vessel.reset_drain_rates();
        self.vessel.set_consumption_rates();
        self.vessel.find_active_engines(self.sim_stage);
        self.vessel.update_mass(self.sim_stage);
    }

    fn current_thrust(&self) -> f64 {
        if self.dv_linear_thrust {
            self.vessel.thrust_magnitude
        } else {
            self.vessel.thrust_no_cos_loss
        }
    }

    fn initial_stats(&self) -> Stats {
        Stats {
            start_mass: self.vessel.mass,
            end_mass: self.vessel.mass,
            start_thrust: self.current_thrust(),
            max_accel: 0.0,
            delta_time: 0.0,
            deltav: 0.0,
            spool_up_time: self.vessel.spoolup_current,
        }
    }
}
