//! Engine performance evaluation at a flight condition.
//!
//! An [`Engine`] is a combined configuration + runtime record: the
//! topology snapshot supplies its static fields, and the simulation
//! refreshes the derived ones (Isp, mass flow, thrust) every step.

use std::collections::HashMap;

use nalgebra::Vector3;
use num_enum::{FromPrimitive, IntoPrimitive};
use serde::{Deserialize, Serialize};

use crate::{
    arena::IdLike,
    curve::FloatCurve,
};

/// Identifies a resource kind (liquid fuel, oxidizer, ...) across the
/// whole vehicle.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
pub struct ResourceId(pub i32);

impl IdLike for ResourceId {
    fn from_raw(index: usize) -> Self {
        Self(index as i32)
    }

    fn into_raw(self) -> usize {
        self.0 as usize
    }
}

/// The vessel-wide rule governing which segments may supply a resource.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    FromPrimitive,
    IntoPrimitive,
)]
#[repr(i32)]
pub enum FlowMode {
    NoFlow = 0,
    AllVessel = 1,
    StagePriorityFlow = 2,
    StackPrioritySearch = 3,
    AllVesselBalance = 4,
    StagePriorityFlowBalance = 5,
    StageStackFlow = 6,
    StageStackFlowBalance = 7,
    #[default]
    Null = 8,
}

/// A propellant consumed by an engine.
#[derive(Copy, Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Propellant {
    pub id: ResourceId,
    /// Is this propellant ignored for ISP calculations?
    pub ignore_for_isp: bool,
    /// Consumption ratio of this resource, in units per second
    pub ratio: f64,
    /// Where is this propellant allowed to come from?
    pub flow_mode: FlowMode,
    /// Density of the propellant, in tons per unit.
    pub density: f64,
}

/// Flight conditions for one simulation call.
#[derive(Copy, Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Conditions {
    pub atm_pressure: f64,
    pub atm_density: f64,
    pub mach_number: f64,
    /// Commanded throttle in `[0, 1]`.
    pub main_throttle: f64,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Engine {
    pub propellants: Vec<Propellant>,
    pub thrust_direction_vectors: Vec<Vector3<f64>>,
    pub thrust_transform_multipliers: Vec<f64>,

    /// Thrust at full throttle in vacuum, kN.
    pub max_thrust: f64,
    pub min_thrust: f64,
    pub max_fuel_flow: f64,
    pub min_fuel_flow: f64,
    /// Thrust limiter percentage, `[0, 100]`.
    pub throttle_limiter: f64,
    /// Throttle-locked engines (SRBs, sepratrons) always burn at full
    /// commanded thrust.
    pub throttle_locked: bool,
    /// Isp (s) as a function of ambient pressure (atm).
    pub atmosphere_curve: FloatCurve,
    pub g: f64,
    /// Maximum unusable propellant fraction, populated from third-party
    /// overrides by the snapshot producer.
    pub module_residuals: f64,
    pub module_spoolup_time: f64,

    // Derived at the current conditions.
    pub isp: f64,
    pub mass_flow_rate: f64,
    pub thrust_current: Vector3<f64>,
    pub resource_consumptions: HashMap<ResourceId, f64>,
}

impl Engine {
    /// Re-evaluates Isp, mass flow, thrust and per-propellant
    /// volumetric rates at the given conditions.
    pub fn update(&mut self, conditions: Conditions) {
        self.isp = self.atmosphere_curve.evaluate(conditions.atm_pressure);
        self.mass_flow_rate = self.flow_rate_at_conditions(conditions);
        self.refresh_thrust();
        self.set_consumption_rates();
    }

    fn flow_rate_at_conditions(&self, conditions: Conditions) -> f64 {
        let mut min_fuel_flow = self.min_fuel_flow;
        let mut max_fuel_flow = self.max_fuel_flow;

        // Engines that only declare thrust get their flow derived from
        // the vacuum Isp.
        if min_fuel_flow == 0.0 && self.min_thrust > 0.0 {
            min_fuel_flow = self.min_thrust / (self.atmosphere_curve.evaluate(0.0) * self.g);
        }
        if max_fuel_flow == 0.0 && self.max_thrust > 0.0 {
            max_fuel_flow = self.max_thrust / (self.atmosphere_curve.evaluate(0.0) * self.g);
        }

        let throttle = if self.throttle_locked {
            1.0
        } else {
            conditions.main_throttle
        };

        lerp(
            min_fuel_flow,
            max_fuel_flow,
            throttle * 0.01 * self.throttle_limiter,
        )
    }

    fn refresh_thrust(&mut self) {
        self.thrust_current = Vector3::zeros();

        let e_current_thrust = self.mass_flow_rate * self.isp * self.g;
        for (i, thrust_direction_vector) in self.thrust_direction_vectors.iter().enumerate() {
            self.thrust_current +=
                e_current_thrust * self.thrust_transform_multipliers[i] * thrust_direction_vector;
        }
    }

    fn set_consumption_rates(&mut self) {
        self.resource_consumptions.clear();

        let mut total_density = 0.0;
        for propellant in &self.propellants {
            if propellant.density <= 0.0 || propellant.ignore_for_isp {
                continue;
            }
            total_density += propellant.ratio * propellant.density;
        }

        if total_density <= 0.0 {
            return;
        }
        let volume_flow_rate = self.mass_flow_rate / total_density;

        for propellant in &self.propellants {
            if propellant.density <= 0.0 {
                continue;
            }
            *self
                .resource_consumptions
                .entry(propellant.id)
                .or_insert(0.0) += propellant.ratio * volume_flow_rate;
        }
    }

    /// Flow mode of every declared propellant, including zero-density
    /// ones that never appear in the consumption map.
    pub fn propellant_flow_modes(&self) -> impl Iterator<Item = (ResourceId, FlowMode)> + '_ {
        self.propellants.iter().map(|p| (p.id, p.flow_mode))
    }
}

pub(crate) fn lerp(x: f64, y: f64, t: f64) -> f64 {
    x + t * (y - x)
}

/// Bare engine with a flat Isp curve, for tests across the crate.
#[cfg(test)]
pub(crate) fn test_engine(max_thrust: f64, isp: f64, propellants: Vec<Propellant>) -> Engine {
    Engine {
        propellants,
        thrust_direction_vectors: vec![Vector3::new(0.0, 1.0, 0.0)],
        thrust_transform_multipliers: vec![1.0],
        max_thrust,
        min_thrust: 0.0,
        max_fuel_flow: 0.0,
        min_fuel_flow: 0.0,
        throttle_limiter: 100.0,
        throttle_locked: false,
        atmosphere_curve: FloatCurve::constant(isp),
        g: crate::G0,
        module_residuals: 0.0,
        module_spoolup_time: 0.0,
        isp: 0.0,
        mass_flow_rate: 0.0,
        thrust_current: Vector3::zeros(),
        resource_consumptions: HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_throttle_thrust_matches_rating() {
        let fuel = Propellant {
            id: ResourceId(0),
            ignore_for_isp: false,
            ratio: 1.0,
            flow_mode: FlowMode::NoFlow,
            density: 0.005,
        };
        let mut engine = test_engine(200.0, 300.0, vec![fuel]);
        engine.update(Conditions {
            main_throttle: 1.0,
            ..Conditions::default()
        });

        assert!((engine.thrust_current.norm() - 200.0).abs() < 1e-9);
        // mdot = F / (isp * g0), volumetric rate = mdot / density.
        let expected_rate = 200.0 / (300.0 * crate::G0) / 0.005;
        let rate = engine.resource_consumptions[&ResourceId(0)];
        assert!((rate - expected_rate).abs() < 1e-9);
    }

    #[test]
    fn throttle_scales_flow_linearly() {
        let fuel = Propellant {
            id: ResourceId(0),
            ignore_for_isp: false,
            ratio: 1.0,
            flow_mode: FlowMode::AllVessel,
            density: 0.005,
        };
        let mut engine = test_engine(100.0, 250.0, vec![fuel]);
        engine.update(Conditions {
            main_throttle: 0.5,
            ..Conditions::default()
        });
        let half = engine.mass_flow_rate;
        engine.update(Conditions {
            main_throttle: 1.0,
            ..Conditions::default()
        });
        assert!((engine.mass_flow_rate - 2.0 * half).abs() < 1e-12);
    }

    #[test]
    fn throttle_locked_ignores_commanded_throttle() {
        let fuel = Propellant {
            id: ResourceId(0),
            ignore_for_isp: false,
            ratio: 1.0,
            flow_mode: FlowMode::NoFlow,
            density: 0.0074,
        };
        let mut engine = test_engine(18.0, 154.0, vec![fuel]);
        engine.throttle_locked = true;
        engine.update(Conditions {
            main_throttle: 0.0,
            ..Conditions::default()
        });
        assert!((engine.thrust_current.norm() - 18.0).abs() < 1e-9);
    }

    #[test]
    fn zero_density_propellants_register_no_consumption() {
        let air = Propellant {
            id: ResourceId(1),
            ignore_for_isp: true,
            ratio: 6.0,
            flow_mode: FlowMode::AllVessel,
            density: 0.0,
        };
        let fuel = Propellant {
            id: ResourceId(0),
            ignore_for_isp: false,
            ratio: 1.0,
            flow_mode: FlowMode::StackPrioritySearch,
            density: 0.005,
        };
        let mut engine = test_engine(120.0, 800.0, vec![air, fuel]);
        engine.update(Conditions {
            main_throttle: 1.0,
            ..Conditions::default()
        });

        assert!(!engine.resource_consumptions.contains_key(&ResourceId(1)));
        assert!(engine.resource_consumptions.contains_key(&ResourceId(0)));
        // The flow mode is still declared for the intake resource.
        assert!(engine
            .propellant_flow_modes()
            .any(|(id, mode)| id == ResourceId(1) && mode == FlowMode::AllVessel));
    }

    #[test]
    fn isp_follows_atmosphere_curve() {
        let mut curve = FloatCurve::new();
        curve.add(0.0, 320.0);
        curve.add(1.0, 250.0);
        let fuel = Propellant {
            id: ResourceId(0),
            ignore_for_isp: false,
            ratio: 1.0,
            flow_mode: FlowMode::NoFlow,
            density: 0.005,
        };
        let mut engine = test_engine(100.0, 300.0, vec![fuel]);
        engine.atmosphere_curve = curve;
        engine.update(Conditions {
            atm_pressure: 1.0,
            main_throttle: 1.0,
            ..Conditions::default()
        });
        assert!((engine.isp - 250.0).abs() < 1e-12);
    }
}
