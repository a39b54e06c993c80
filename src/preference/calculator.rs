//! Exponential moving average over product vectors.
//!
//! `new = normalize(old * (1 - alpha) + product * alpha)`, with alpha chosen
//! by how strong a signal the action is.

use crate::error::{Error, Result};
use crate::model::ActionType;
use crate::vector::normalize;
use tracing::warn;

pub const ALPHA_VIEW: f32 = 0.1;
pub const ALPHA_SEARCH: f32 = 0.2;
pub const ALPHA_CLICK: f32 = 0.3;
pub const ALPHA_PURCHASE: f32 = 0.5;

pub fn alpha(action: ActionType) -> f32 {
    match action {
        ActionType::View => ALPHA_VIEW,
        ActionType::Search => ALPHA_SEARCH,
        ActionType::Click => ALPHA_CLICK,
        ActionType::AddToCart => ALPHA_CLICK,
        ActionType::Wishlist => ALPHA_VIEW,
        ActionType::Purchase => ALPHA_PURCHASE,
        ActionType::Unknown => 0.0,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PreferenceVectorCalculator {
    dimension: usize,
}

impl PreferenceVectorCalculator {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Blend one product vector into the current preference. Dimensions are
    /// checked before anything is computed; a mismatch is never truncated or
    /// padded.
    pub fn update(&self, current: Option<&[f32]>, product: &[f32], action: ActionType) -> Result<Vec<f32>> {
        self.check_dimension(product)?;
        if let Some(current) = current {
            self.check_dimension(current)?;
        }

        let alpha = alpha(action);
        if alpha == 0.0 {
            warn!("Unknown actionType {}, preference left unchanged", action);
            return Ok(match current {
                Some(current) => current.to_vec(),
                None => normalize(product),
            });
        }

        let Some(current) = current else {
            return Ok(normalize(product));
        };

        let blended: Vec<f32> = current
            .iter()
            .zip(product)
            .map(|(old, new)| old * (1.0 - alpha) + new * alpha)
            .collect();

        Ok(normalize(&blended))
    }

    /// Apply several `(product vector, action)` pairs in order.
    pub fn update_batch(&self, current: Option<&[f32]>, updates: &[(&[f32], ActionType)]) -> Result<Option<Vec<f32>>> {
        let mut result = current.map(<[f32]>::to_vec);
        for (product, action) in updates {
            result = Some(self.update(result.as_deref(), product, *action)?);
        }
        Ok(result)
    }
}
