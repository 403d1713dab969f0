use crate::{error::Result, types::ParameterBuffer, PoisonError};
use rand::RngCore;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Closed set of corruption strategies an adversarial node can apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttackType {
    /// Replace every weight by zero.
    Zero,
    /// Multiply every weight by `-strength`.
    Flip,
    /// Add zero-mean Gaussian noise of standard deviation `strength`.
    Noise,
    /// Multiply every weight by `strength`.
    Scale,
}

impl AttackType {
    /// All supported attacks, in configuration order.
    pub const ALL: [AttackType; 4] = [Self::Zero, Self::Flip, Self::Noise, Self::Scale];

    /// Name used in configuration files and result paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zero => "zero",
            Self::Flip => "flip",
            Self::Noise => "noise",
            Self::Scale => "scale",
        }
    }
}

impl fmt::Display for AttackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttackType {
    type Err = PoisonError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|attack| attack.as_str() == name)
            .ok_or_else(|| PoisonError::UnknownAttackType(s.to_string()))
    }
}

/// Trait for strategies that corrupt a model update before it is sent.
///
/// Implementors must return a buffer of the same length as the input and leave
/// the input untouched.
pub trait AttackStrategy: Send + Sync {
    /// Produces the corrupted version of `buffer`.
    fn apply(&self, buffer: &ParameterBuffer, rng: &mut dyn RngCore) -> Result<ParameterBuffer>;
}

/// Default strategy: one [`AttackType`] at a fixed strength.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoisonAttack {
    attack_type: AttackType,
    strength: f64,
}

/// Rejects strengths that are negative, not finite, or too large for an `f32` weight.
fn check_strength(strength: f64) -> Result<f32> {
    if !strength.is_finite() || strength < 0.0 || strength > f32::MAX as f64 {
        return Err(PoisonError::InvalidConfig(format!(
            "poison_strength must be finite, non-negative and at most {}, got {strength}",
            f32::MAX
        )));
    }
    Ok(strength as f32)
}

impl PoisonAttack {
    /// Creates a strategy with the given attack and strength.
    ///
    /// # Arguments
    /// * `attack_type` - Corruption applied to every poisoned update.
    /// * `strength` - Magnitude for flip, noise and scale (finite, non-negative, within `f32`).
    ///
    /// # Errors
    /// Returns an error if `strength` is negative, not finite, or exceeds `f32::MAX`.
    pub fn new(attack_type: AttackType, strength: f64) -> Result<Self> {
        check_strength(strength)?;
        Ok(Self {
            attack_type,
            strength,
        })
    }

    /// Corruption applied to poisoned updates.
    pub fn attack_type(&self) -> AttackType {
        self.attack_type
    }

    /// Magnitude used by flip, noise and scale.
    pub fn strength(&self) -> f64 {
        self.strength
    }
}

impl AttackStrategy for PoisonAttack {
    fn apply(
        &self,
        buffer: &ParameterBuffer,
        rng: &mut dyn RngCore,
    ) -> Result<ParameterBuffer> {
        apply_attack(buffer, self.attack_type, self.strength, rng)
    }
}

/// Applies `attack_type` to a copy of `buffer`.
///
/// `rng` is only consumed by [`AttackType::Noise`].
///
/// # Errors
/// Returns an error if `strength` is out of range or the noise distribution cannot be built.
pub fn apply_attack(
    buffer: &ParameterBuffer,
    attack_type: AttackType,
    strength: f64,
    rng: &mut dyn RngCore,
) -> Result<ParameterBuffer> {
    let s = check_strength(strength)?;
    let out = match attack_type {
        AttackType::Zero => vec![0.0; buffer.len()],
        AttackType::Flip => buffer.iter().map(|&x| x * -s).collect(),
        AttackType::Scale => buffer.iter().map(|&x| x * s).collect(),
        AttackType::Noise => {
            if strength == 0.0 {
                return Ok(buffer.clone());
            }
            let normal = Normal::new(0.0_f32, s).map_err(|e| {
                PoisonError::InvalidConfig(format!("noise strength {strength}: {e}"))
            })?;
            buffer.iter().map(|&x| x + normal.sample(&mut *rng)).collect()
        }
    };
    Ok(out)
}
