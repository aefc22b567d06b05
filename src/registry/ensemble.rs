use super::version::{ModelKind, ModelVersion, VersionId};
use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Weighted combination of one base model and its member models. Serialized as the artifact of
/// the ensemble's own registry version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleSpec {
    pub base_model_ref: VersionId,
    pub member_refs: Vec<VersionId>,
    /// Version id -> weight.
    pub weights: BTreeMap<String, f64>,
}

impl EnsembleSpec {
    /// Validates the composition and assigns weights.
    ///
    /// The base must dominate: `base_weight >= member_weight`. Members must be distinct,
    /// registered, non-base and not ensembles themselves.
    pub(crate) fn compose(
        base: &ModelVersion,
        members: &[&ModelVersion],
        base_weight: f64,
        member_weight: f64,
    ) -> Result<Self, SyncError> {
        if !(base_weight.is_finite() && member_weight.is_finite()) || member_weight < 0.0 {
            return Err(SyncError::InvalidEnsemble(format!(
                "weights must be finite and non-negative (base {base_weight}, member {member_weight})"
            )));
        }
        if base_weight < member_weight {
            return Err(SyncError::InvalidEnsemble(format!(
                "base weight {base_weight} is below member weight {member_weight}"
            )));
        }

        let mut weights = BTreeMap::new();
        weights.insert(base.version_id.to_string(), base_weight);

        let mut member_refs = Vec::with_capacity(members.len());
        for member in members {
            if member.version_id == base.version_id || member.is_base {
                return Err(SyncError::InvalidEnsemble(format!(
                    "{} is a base model and cannot be a member",
                    member.version_id
                )));
            }
            if member.kind == ModelKind::Ensemble {
                return Err(SyncError::InvalidEnsemble(format!(
                    "{} is itself an ensemble",
                    member.version_id
                )));
            }
            if weights
                .insert(member.version_id.to_string(), member_weight)
                .is_some()
            {
                return Err(SyncError::InvalidEnsemble(format!(
                    "{} listed twice",
                    member.version_id
                )));
            }
            member_refs.push(member.version_id.clone());
        }

        Ok(Self {
            base_model_ref: base.version_id.clone(),
            member_refs,
            weights,
        })
    }

    pub fn weight_of(&self, id: &VersionId) -> Option<f64> {
        self.weights.get(id.as_str()).copied()
    }
}
