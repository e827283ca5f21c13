//! FairShare-Core: Utility Function Library
//!
//! An agent's valuation of an allocation, as a closed sum type over the
//! supported shapes. The solvers dispatch on the variant directly; there is
//! no open inheritance because the set of shapes is finite and the gradient
//! arbitrator needs cheap dispatch.
//!
//! Every variant is concave or quasi-concave on the feasible box. The
//! kinked variants (Leontief, sharp Threshold, Satiation) return a
//! subgradient from [`UtilityFunction::gradient`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::resource::{ResourceBundle, ResourceType};
use crate::EPSILON;

/// Per-resource preference weights.
pub type Weights = BTreeMap<ResourceType, f64>;

/// A continuous allocation point, as used by the solvers.
pub type Point = BTreeMap<ResourceType, f64>;

fn amount(point: &Point, resource: ResourceType) -> f64 {
    point.get(&resource).copied().unwrap_or(0.0)
}

/// One nest of a nested-CES utility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CesNest {
    /// Weight of this nest in the outer aggregate
    pub weight: f64,
    /// Elasticity parameter of the inner aggregate
    pub rho: f64,
    /// Per-resource weights inside the nest
    pub weights: Weights,
}

/// An agent's valuation of an allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UtilityFunction {
    /// Φ = Σ wⱼ·aⱼ
    Linear { weights: Weights },
    /// Φ = (Σ wⱼ·√aⱼ)²
    SquareRoot { weights: Weights },
    /// Φ = Σ wⱼ·log(1+aⱼ)
    Log { weights: Weights },
    /// Φ = Π aⱼ^wⱼ, zero if any weighted aⱼ is zero
    CobbDouglas { weights: Weights },
    /// Φ = minⱼ(aⱼ/wⱼ) over weighted resources
    Leontief { weights: Weights },
    /// Φ = (Σ wⱼ·aⱼ^ρ)^(1/ρ); ρ→1 linear, ρ→0 Cobb-Douglas, ρ→−∞ Leontief
    Ces { weights: Weights, rho: f64 },
    /// Linear value gated at a threshold; `sharpness` selects the soft
    /// (logistic) cutoff, absent means the sharp one.
    Threshold {
        weights: Weights,
        threshold: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        sharpness: Option<f64>,
    },
    /// Linear value capped at `cap`
    Satiation { weights: Weights, cap: f64 },
    /// Asymmetric-log value around a per-resource reference point; losses
    /// are amplified by `aversion` (≥ 1).
    LossAversion {
        weights: Weights,
        reference: BTreeMap<ResourceType, f64>,
        aversion: f64,
    },
    /// Outer CES over inner CES nests
    NestedCes { nests: Vec<CesNest>, rho: f64 },
}

impl UtilityFunction {
    /// Uniform linear utility over the given resources.
    pub fn uniform_linear<'a>(resources: impl IntoIterator<Item = &'a ResourceType>) -> Self {
        UtilityFunction::Linear {
            weights: resources.into_iter().map(|&r| (r, 1.0)).collect(),
        }
    }

    /// Evaluate the utility at a continuous allocation point.
    ///
    /// Always nonnegative.
    pub fn evaluate(&self, point: &Point) -> f64 {
        match self {
            UtilityFunction::Linear { weights } => linear_value(weights, point),
            UtilityFunction::SquareRoot { weights } => {
                let s: f64 = weights
                    .iter()
                    .map(|(&r, &w)| w * amount(point, r).max(0.0).sqrt())
                    .sum();
                s * s
            }
            UtilityFunction::Log { weights } => weights
                .iter()
                .map(|(&r, &w)| w * (1.0 + amount(point, r).max(0.0)).ln())
                .sum(),
            UtilityFunction::CobbDouglas { weights } => {
                let mut product = 1.0;
                for (&r, &w) in weights {
                    if w <= 0.0 {
                        continue;
                    }
                    let a = amount(point, r);
                    if a <= 0.0 {
                        return 0.0;
                    }
                    product *= a.powf(w);
                }
                product
            }
            UtilityFunction::Leontief { weights } => {
                let min_ratio = weights
                    .iter()
                    .filter(|(_, &w)| w > 0.0)
                    .map(|(&r, &w)| amount(point, r).max(0.0) / w)
                    .fold(f64::INFINITY, f64::min);
                if min_ratio.is_finite() {
                    min_ratio
                } else {
                    0.0
                }
            }
            UtilityFunction::Ces { weights, rho } => ces_value(weights, *rho, point),
            UtilityFunction::Threshold {
                weights,
                threshold,
                sharpness,
            } => {
                let v = linear_value(weights, point);
                match sharpness {
                    None => {
                        if v >= *threshold {
                            v
                        } else {
                            0.0
                        }
                    }
                    Some(k) => v * logistic(k * (v - threshold)),
                }
            }
            UtilityFunction::Satiation { weights, cap } => {
                linear_value(weights, point).min(*cap)
            }
            UtilityFunction::LossAversion {
                weights,
                reference,
                aversion,
            } => {
                let mut value = 0.0;
                for (&r, &w) in weights {
                    let d = amount(point, r) - reference.get(&r).copied().unwrap_or(0.0);
                    if d >= 0.0 {
                        value += w * (1.0 + d).ln();
                    } else {
                        value -= w * aversion * (1.0 - d).ln();
                    }
                }
                value.max(0.0)
            }
            UtilityFunction::NestedCes { nests, rho } => {
                let inner: Vec<(f64, f64)> = nests
                    .iter()
                    .map(|nest| (nest.weight, ces_value(&nest.weights, nest.rho, point)))
                    .collect();
                aggregate_ces(&inner, *rho)
            }
        }
    }

    /// Evaluate at an integer bundle.
    pub fn evaluate_bundle(&self, bundle: &ResourceBundle) -> f64 {
        let point: Point = bundle.iter().map(|(r, q)| (r, q as f64)).collect();
        self.evaluate(&point)
    }

    /// Partial derivative (or subgradient) with respect to one resource.
    pub fn gradient(&self, point: &Point, resource: ResourceType) -> f64 {
        match self {
            UtilityFunction::Linear { weights } => weight_of(weights, resource),
            UtilityFunction::SquareRoot { weights } => {
                let w = weight_of(weights, resource);
                if w == 0.0 {
                    return 0.0;
                }
                let s: f64 = weights
                    .iter()
                    .map(|(&r, &wr)| wr * amount(point, r).max(0.0).sqrt())
                    .sum();
                s * w / amount(point, resource).max(EPSILON).sqrt()
            }
            UtilityFunction::Log { weights } => {
                let w = weight_of(weights, resource);
                w / (1.0 + amount(point, resource).max(0.0))
            }
            UtilityFunction::CobbDouglas { weights } => {
                let w = weight_of(weights, resource);
                if w == 0.0 {
                    return 0.0;
                }
                // Evaluate with floored amounts so the gradient still points
                // uphill from the zero boundary.
                let mut product = 1.0;
                for (&r, &wr) in weights {
                    if wr <= 0.0 {
                        continue;
                    }
                    product *= amount(point, r).max(EPSILON).powf(wr);
                }
                w * product / amount(point, resource).max(EPSILON)
            }
            UtilityFunction::Leontief { weights } => {
                let w = weight_of(weights, resource);
                if w <= 0.0 {
                    return 0.0;
                }
                // Subgradient: only the first bottleneck resource moves the
                // minimum.
                let bottleneck = weights
                    .iter()
                    .filter(|(_, &wr)| wr > 0.0)
                    .min_by(|(&ra, &wa), (&rb, &wb)| {
                        let va = amount(point, ra).max(0.0) / wa;
                        let vb = amount(point, rb).max(0.0) / wb;
                        va.partial_cmp(&vb).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|(&r, _)| r);
                if bottleneck == Some(resource) {
                    1.0 / w
                } else {
                    0.0
                }
            }
            UtilityFunction::Ces { weights, rho } => ces_gradient(weights, *rho, point, resource),
            UtilityFunction::Threshold {
                weights,
                threshold,
                sharpness,
            } => {
                let w = weight_of(weights, resource);
                let v = linear_value(weights, point);
                match sharpness {
                    None => {
                        if v >= *threshold {
                            w
                        } else {
                            0.0
                        }
                    }
                    Some(k) => {
                        let sig = logistic(k * (v - threshold));
                        (sig + v * k * sig * (1.0 - sig)) * w
                    }
                }
            }
            UtilityFunction::Satiation { weights, cap } => {
                if linear_value(weights, point) < *cap {
                    weight_of(weights, resource)
                } else {
                    0.0
                }
            }
            UtilityFunction::LossAversion {
                weights,
                reference,
                aversion,
            } => {
                let w = weight_of(weights, resource);
                if w == 0.0 {
                    return 0.0;
                }
                let d = amount(point, resource) - reference.get(&resource).copied().unwrap_or(0.0);
                if d >= 0.0 {
                    w / (1.0 + d)
                } else {
                    w * aversion / (1.0 - d)
                }
            }
            UtilityFunction::NestedCes { nests, rho } => {
                let inner: Vec<(f64, f64)> = nests
                    .iter()
                    .map(|nest| (nest.weight, ces_value(&nest.weights, nest.rho, point)))
                    .collect();
                let outer = aggregate_ces(&inner, *rho);
                if outer <= 0.0 {
                    return 0.0;
                }
                let mut grad = 0.0;
                for (nest, &(weight, value)) in nests.iter().zip(inner.iter()) {
                    let inner_grad = ces_gradient(&nest.weights, nest.rho, point, resource);
                    if inner_grad == 0.0 {
                        continue;
                    }
                    // d outer / d inner via the chain rule; the rho≈0 outer
                    // degenerates to the geometric mean.
                    let d_outer = if rho.abs() < EPSILON {
                        let total_weight: f64 = inner.iter().map(|(w, _)| w).sum();
                        outer * (weight / total_weight.max(EPSILON)) / value.max(EPSILON)
                    } else {
                        outer.powf(1.0 - rho) * weight * value.max(EPSILON).powf(rho - 1.0)
                    };
                    grad += d_outer * inner_grad;
                }
                grad
            }
        }
    }

    /// Per-resource weights, where the variant has a flat weight map.
    pub fn weights(&self) -> Option<&Weights> {
        match self {
            UtilityFunction::Linear { weights }
            | UtilityFunction::SquareRoot { weights }
            | UtilityFunction::Log { weights }
            | UtilityFunction::CobbDouglas { weights }
            | UtilityFunction::Leontief { weights }
            | UtilityFunction::Ces { weights, .. }
            | UtilityFunction::Threshold { weights, .. }
            | UtilityFunction::Satiation { weights, .. }
            | UtilityFunction::LossAversion { weights, .. } => Some(weights),
            UtilityFunction::NestedCes { .. } => None,
        }
    }

    /// Preference weight for one resource (flat variants; nested CES sums
    /// its nests). Used when a solver needs a linear proxy.
    pub fn preference_weight(&self, resource: ResourceType) -> f64 {
        match self {
            UtilityFunction::NestedCes { nests, .. } => nests
                .iter()
                .map(|nest| nest.weight * weight_of(&nest.weights, resource))
                .sum(),
            _ => self
                .weights()
                .map(|w| weight_of(w, resource))
                .unwrap_or(0.0),
        }
    }

    /// Validate parameters. Called by the configuration layer.
    pub fn validate(&self) -> Result<(), UtilityError> {
        let check_weights = |weights: &Weights| -> Result<(), UtilityError> {
            if weights.values().any(|&w| w < 0.0 || !w.is_finite()) {
                return Err(UtilityError::NegativeWeight);
            }
            if !weights.values().any(|&w| w > 0.0) {
                return Err(UtilityError::NoPositiveWeight);
            }
            Ok(())
        };

        match self {
            UtilityFunction::Ces { weights, rho } => {
                check_weights(weights)?;
                if *rho > 1.0 || !rho.is_finite() {
                    return Err(UtilityError::InvalidElasticity { rho: *rho });
                }
                Ok(())
            }
            UtilityFunction::Threshold {
                weights, threshold, ..
            } => {
                check_weights(weights)?;
                if *threshold < 0.0 {
                    return Err(UtilityError::InvalidParameter {
                        parameter: "threshold",
                    });
                }
                Ok(())
            }
            UtilityFunction::Satiation { weights, cap } => {
                check_weights(weights)?;
                if *cap <= 0.0 {
                    return Err(UtilityError::InvalidParameter { parameter: "cap" });
                }
                Ok(())
            }
            UtilityFunction::LossAversion {
                weights, aversion, ..
            } => {
                check_weights(weights)?;
                if *aversion < 1.0 {
                    return Err(UtilityError::InvalidParameter {
                        parameter: "aversion",
                    });
                }
                Ok(())
            }
            UtilityFunction::NestedCes { nests, rho } => {
                if nests.is_empty() {
                    return Err(UtilityError::NoPositiveWeight);
                }
                for nest in nests {
                    check_weights(&nest.weights)?;
                    if nest.rho > 1.0 || !nest.rho.is_finite() {
                        return Err(UtilityError::InvalidElasticity { rho: nest.rho });
                    }
                }
                if *rho > 1.0 || !rho.is_finite() {
                    return Err(UtilityError::InvalidElasticity { rho: *rho });
                }
                Ok(())
            }
            _ => check_weights(self.weights().expect("flat variant has weights")),
        }
    }
}

/// Utility parameter errors.
#[derive(Debug, thiserror::Error)]
pub enum UtilityError {
    #[error("utility weights must be nonnegative and finite")]
    NegativeWeight,

    #[error("utility needs at least one positive weight")]
    NoPositiveWeight,

    #[error("CES elasticity rho={rho} outside (-inf, 1]")]
    InvalidElasticity { rho: f64 },

    #[error("invalid utility parameter: {parameter}")]
    InvalidParameter { parameter: &'static str },
}

fn weight_of(weights: &Weights, resource: ResourceType) -> f64 {
    weights.get(&resource).copied().unwrap_or(0.0)
}

fn linear_value(weights: &Weights, point: &Point) -> f64 {
    weights
        .iter()
        .map(|(&r, &w)| w * amount(point, r).max(0.0))
        .sum()
}

fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// CES aggregate over a flat weight map. ρ near zero degenerates to the
/// Cobb-Douglas (geometric-mean) limit with normalized weights.
fn ces_value(weights: &Weights, rho: f64, point: &Point) -> f64 {
    if rho.abs() < EPSILON {
        let total_weight: f64 = weights.values().filter(|&&w| w > 0.0).sum();
        if total_weight <= 0.0 {
            return 0.0;
        }
        let mut product = 1.0;
        for (&r, &w) in weights {
            if w <= 0.0 {
                continue;
            }
            let a = amount(point, r);
            if a <= 0.0 {
                return 0.0;
            }
            product *= a.powf(w / total_weight);
        }
        return product;
    }

    let s: f64 = weights
        .iter()
        .filter(|(_, &w)| w > 0.0)
        .map(|(&r, &w)| w * amount(point, r).max(EPSILON).powf(rho))
        .sum();
    if s <= 0.0 {
        return 0.0;
    }
    s.powf(1.0 / rho)
}

fn ces_gradient(weights: &Weights, rho: f64, point: &Point, resource: ResourceType) -> f64 {
    let w = weight_of(weights, resource);
    if w <= 0.0 {
        return 0.0;
    }

    if rho.abs() < EPSILON {
        let total_weight: f64 = weights.values().filter(|&&w| w > 0.0).sum();
        let value = ces_value(weights, rho, point);
        let floored = if value > 0.0 {
            value
        } else {
            // Gradient off the zero boundary, as with Cobb-Douglas.
            let mut product = 1.0;
            for (&r, &wr) in weights {
                if wr <= 0.0 {
                    continue;
                }
                product *= amount(point, r).max(EPSILON).powf(wr / total_weight.max(EPSILON));
            }
            product
        };
        return (w / total_weight.max(EPSILON)) * floored
            / amount(point, resource).max(EPSILON);
    }

    let s: f64 = weights
        .iter()
        .filter(|(_, &wr)| wr > 0.0)
        .map(|(&r, &wr)| wr * amount(point, r).max(EPSILON).powf(rho))
        .sum();
    if s <= 0.0 {
        return 0.0;
    }
    s.powf(1.0 / rho - 1.0) * w * amount(point, resource).max(EPSILON).powf(rho - 1.0)
}

fn aggregate_ces(parts: &[(f64, f64)], rho: f64) -> f64 {
    if rho.abs() < EPSILON {
        let total_weight: f64 = parts.iter().map(|(w, _)| w).filter(|&&w| w > 0.0).sum();
        if total_weight <= 0.0 {
            return 0.0;
        }
        let mut product = 1.0;
        for &(w, v) in parts {
            if w <= 0.0 {
                continue;
            }
            if v <= 0.0 {
                return 0.0;
            }
            product *= v.powf(w / total_weight);
        }
        return product;
    }

    let s: f64 = parts
        .iter()
        .filter(|(w, _)| *w > 0.0)
        .map(|&(w, v)| w * v.max(EPSILON).powf(rho))
        .sum();
    if s <= 0.0 {
        return 0.0;
    }
    s.powf(1.0 / rho)
}
