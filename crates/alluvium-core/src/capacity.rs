//! Transport-capacity formulas.
//!
//! The engine treats the capacity relation as a pluggable policy behind
//! [`CapacityFormula`]: given a grain size, the reach shear stress, and the
//! grain's critical stress, produce a unit-width volumetric transport rate.
//! Swapping formulations never touches the engine; [`FormulaKind`] is the
//! serializable selector carried in config and snapshots, and
//! `Engine::set_capacity_formula` accepts external implementations.

use serde::{Deserialize, Serialize};

/// Inputs to a capacity formula for one grain class in one reach.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportInput {
    /// Grain diameter, m.
    pub grain_size: f64,
    /// Bed shear stress of the reach, Pa.
    pub shear_stress: f64,
    /// Critical shear stress for this grain, Pa.
    pub critical_stress: f64,
    /// Sediment density, kg/m^3.
    pub sediment_density: f64,
    /// Water density, kg/m^3.
    pub water_density: f64,
    /// Gravitational acceleration, m/s^2.
    pub gravity: f64,
}

impl TransportInput {
    /// Submerged specific gravity s - 1.
    pub fn submerged_gravity(&self) -> f64 {
        (self.sediment_density - self.water_density) / self.water_density
    }

    /// Shields stress on this grain.
    pub fn shields_stress(&self) -> f64 {
        self.shear_stress
            / ((self.sediment_density - self.water_density) * self.gravity * self.grain_size)
    }

    /// Critical Shields number implied by `critical_stress`.
    pub fn critical_shields(&self) -> f64 {
        self.critical_stress
            / ((self.sediment_density - self.water_density) * self.gravity * self.grain_size)
    }

    /// Ratio of bed stress to critical stress. > 1 means mobile.
    pub fn stress_ratio(&self) -> f64 {
        self.shear_stress / self.critical_stress
    }

    /// sqrt((s - 1) g d^3): converts a dimensionless rate to m^2/s.
    pub fn rate_scale(&self) -> f64 {
        let d = self.grain_size;
        (self.submerged_gravity() * self.gravity * d * d * d).sqrt()
    }
}

/// A bed-load capacity relation.
///
/// Implementations return the unit-width volumetric transport rate q_b in
/// m^2/s, never negative. The engine only calls this for parcels at or above
/// the mobility threshold, but implementations must still behave at and
/// below it (return 0 or a vanishing rate).
pub trait CapacityFormula: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Unit-width transport rate, m^2/s.
    fn unit_transport_rate(&self, input: &TransportInput) -> f64;
}

/// Serializable formula selector for config and snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormulaKind {
    MeyerPeterMuller,
    WilcockCrowe,
}

impl FormulaKind {
    pub fn instantiate(&self) -> Box<dyn CapacityFormula> {
        match self {
            FormulaKind::MeyerPeterMuller => Box::new(MeyerPeterMuller::new()),
            FormulaKind::WilcockCrowe => Box::new(WilcockCrowe::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// Meyer-Peter & Mueller
// ---------------------------------------------------------------------------

/// Meyer-Peter & Mueller (1948) excess-stress relation.
///
/// phi = a * (theta - theta_cr)^b, q_b = phi * sqrt((s-1) g d^3).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeyerPeterMuller {
    /// Leading coefficient, 8 in the original fit.
    pub coefficient: f64,
    /// Excess-stress exponent, 1.5 in the original fit.
    pub exponent: f64,
}

impl MeyerPeterMuller {
    pub fn new() -> Self {
        Self {
            coefficient: 8.0,
            exponent: 1.5,
        }
    }

    pub fn with_coefficient(mut self, coefficient: f64) -> Self {
        self.coefficient = coefficient;
        self
    }
}

impl Default for MeyerPeterMuller {
    fn default() -> Self {
        Self::new()
    }
}

impl CapacityFormula for MeyerPeterMuller {
    fn name(&self) -> &'static str {
        "meyer-peter-muller"
    }

    fn unit_transport_rate(&self, input: &TransportInput) -> f64 {
        let excess = input.shields_stress() - input.critical_shields();
        if excess <= 0.0 {
            return 0.0;
        }
        self.coefficient * excess.powf(self.exponent) * input.rate_scale()
    }
}

// ---------------------------------------------------------------------------
// Wilcock & Crowe
// ---------------------------------------------------------------------------

/// Wilcock & Crowe (2003) two-regime relation, with the parcel's critical
/// stress standing in for the per-fraction reference stress.
///
/// W* = 0.002 phi^7.5 below the regime break, otherwise
/// W* = 14 (1 - 0.894 / sqrt(phi))^4.5, with phi = tau / tau_r;
/// q_b = W* u*^3 / ((s-1) g).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WilcockCrowe {
    /// phi where the two regimes meet; 1.35 in the original fit.
    pub regime_break: f64,
}

impl WilcockCrowe {
    pub fn new() -> Self {
        Self { regime_break: 1.35 }
    }
}

impl Default for WilcockCrowe {
    fn default() -> Self {
        Self::new()
    }
}

impl CapacityFormula for WilcockCrowe {
    fn name(&self) -> &'static str {
        "wilcock-crowe"
    }

    fn unit_transport_rate(&self, input: &TransportInput) -> f64 {
        if input.shear_stress <= 0.0 {
            return 0.0;
        }
        let phi = input.stress_ratio();
        let w_star = if phi < self.regime_break {
            0.002 * phi.powf(7.5)
        } else {
            14.0 * (1.0 - 0.894 / phi.sqrt()).powf(4.5)
        };
        let u_star = (input.shear_stress / input.water_density).sqrt();
        w_star * u_star.powi(3) / (input.submerged_gravity() * input.gravity)
    }
}
