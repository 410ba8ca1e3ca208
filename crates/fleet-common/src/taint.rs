use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::FleetError;

const MAX_NAME_LEN: usize = 63;
const MAX_PREFIX_LEN: usize = 253;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

impl TaintEffect {
    /// `PreferNoSchedule` only discourages placement, it never excludes a pool.
    pub fn repels(self) -> bool {
        !matches!(self, TaintEffect::PreferNoSchedule)
    }
}

impl fmt::Display for TaintEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaintEffect::NoSchedule => "NoSchedule",
            TaintEffect::PreferNoSchedule => "PreferNoSchedule",
            TaintEffect::NoExecute => "NoExecute",
        };
        f.write_str(s)
    }
}

/// A repulsion marker carried by every node of a pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub effect: TaintEffect,
}

impl Taint {
    pub fn new(key: impl Into<String>, value: impl Into<String>, effect: TaintEffect) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            effect,
        }
    }
}

impl fmt::Display for Taint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}:{}", self.key, self.value, self.effect)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TolerationOperator {
    #[default]
    Equal,
    Exists,
}

/// Permission carried by a workload to ignore matching taints.
///
/// Matching follows the scheduler's rules: an empty key with `Exists`
/// tolerates every taint, and an absent effect matches every effect.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Toleration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub operator: TolerationOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<TaintEffect>,
}

impl Toleration {
    pub fn equal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            operator: TolerationOperator::Equal,
            value: Some(value.into()),
            effect: None,
        }
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            operator: TolerationOperator::Exists,
            value: None,
            effect: None,
        }
    }

    pub fn with_effect(mut self, effect: TaintEffect) -> Self {
        self.effect = Some(effect);
        self
    }

    pub fn tolerates(&self, taint: &Taint) -> bool {
        if let Some(effect) = self.effect {
            if effect != taint.effect {
                return false;
            }
        }
        match self.key.as_deref() {
            None | Some("") => self.operator == TolerationOperator::Exists,
            Some(key) if key != taint.key => false,
            Some(_) => match self.operator {
                TolerationOperator::Exists => true,
                TolerationOperator::Equal => self.value.as_deref().unwrap_or("") == taint.value,
            },
        }
    }
}

/// True when every repelling taint of a pool is matched by some toleration.
pub fn tolerates_all(tolerations: &[Toleration], taints: &[Taint]) -> bool {
    taints
        .iter()
        .filter(|t| t.effect.repels())
        .all(|t| tolerations.iter().any(|tol| tol.tolerates(t)))
}

/// Check a pool's taint set: well-formed keys and values, no repeated key.
pub fn validate_taints(taints: &[Taint]) -> Result<(), FleetError> {
    let mut seen = HashSet::new();
    for taint in taints {
        validate_key(&taint.key)?;
        if taint.value.len() > MAX_NAME_LEN {
            return Err(FleetError::invalid_taints(format!(
                "value of taint {} exceeds {MAX_NAME_LEN} characters",
                taint.key
            )));
        }
        if !taint.value.is_empty() && !is_name_segment(&taint.value) {
            return Err(FleetError::invalid_taints(format!(
                "value {:?} of taint {} contains invalid characters",
                taint.value, taint.key
            )));
        }
        if !seen.insert(taint.key.as_str()) {
            return Err(FleetError::invalid_taints(format!(
                "duplicate taint key {}",
                taint.key
            )));
        }
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<(), FleetError> {
    if key.is_empty() {
        return Err(FleetError::invalid_taints("taint key is empty"));
    }
    let (prefix, name) = match key.rsplit_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };
    if let Some(prefix) = prefix {
        let valid_prefix = !prefix.is_empty()
            && prefix.len() <= MAX_PREFIX_LEN
            && prefix
                .split('.')
                .all(|label| !label.is_empty() && is_name_segment(label) && !label.contains('_'));
        if !valid_prefix {
            return Err(FleetError::invalid_taints(format!(
                "taint key {key} has an invalid prefix"
            )));
        }
    }
    if name.is_empty() || name.len() > MAX_NAME_LEN || !is_name_segment(name) {
        return Err(FleetError::invalid_taints(format!(
            "taint key {key} is not a valid qualified name"
        )));
    }
    Ok(())
}

/// Alphanumeric at both ends, `-`, `_` or `.` in between.
fn is_name_segment(s: &str) -> bool {
    let bytes = s.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    first.is_ascii_alphanumeric()
        && last.is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingress_taint() -> Taint {
        Taint::new("role", "ingress", TaintEffect::NoSchedule)
    }

    #[test]
    fn equal_toleration_matches_key_and_value() {
        assert!(Toleration::equal("role", "ingress").tolerates(&ingress_taint()));
        assert!(!Toleration::equal("role", "batch").tolerates(&ingress_taint()));
        assert!(!Toleration::equal("nginx", "ingress").tolerates(&ingress_taint()));
    }

    #[test]
    fn exists_toleration_ignores_value() {
        assert!(Toleration::exists("role").tolerates(&ingress_taint()));
        let wildcard = Toleration {
            operator: TolerationOperator::Exists,
            ..Default::default()
        };
        assert!(wildcard.tolerates(&ingress_taint()));
    }

    #[test]
    fn effect_must_match_when_given() {
        let tol = Toleration::equal("role", "ingress").with_effect(TaintEffect::NoExecute);
        assert!(!tol.tolerates(&ingress_taint()));
        let tol = Toleration::equal("role", "ingress").with_effect(TaintEffect::NoSchedule);
        assert!(tol.tolerates(&ingress_taint()));
    }

    #[test]
    fn untainted_pool_is_tolerated_by_everyone() {
        assert!(tolerates_all(&[], &[]));
        assert!(tolerates_all(&[Toleration::equal("role", "ingress")], &[]));
    }

    #[test]
    fn prefer_no_schedule_never_excludes() {
        let soft = Taint::new("spot", "true", TaintEffect::PreferNoSchedule);
        assert!(tolerates_all(&[], &[soft]));
    }

    #[test]
    fn every_repelling_taint_needs_a_toleration() {
        let taints = vec![
            ingress_taint(),
            Taint::new("gpu", "a100", TaintEffect::NoExecute),
        ];
        assert!(!tolerates_all(&[Toleration::equal("role", "ingress")], &taints));
        assert!(tolerates_all(
            &[Toleration::equal("role", "ingress"), Toleration::exists("gpu")],
            &taints
        ));
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let taints = vec![
            Taint::new("role", "ingress", TaintEffect::NoSchedule),
            Taint::new("role", "batch", TaintEffect::NoExecute),
        ];
        let err = validate_taints(&taints).unwrap_err();
        assert!(matches!(err, FleetError::InvalidTaintSet(ref m) if m.contains("duplicate")));
    }

    #[test]
    fn malformed_keys_and_values_are_rejected() {
        for key in ["", "-role", "role-", "has space", "/role", "a_b.example.com/role"] {
            let taints = vec![Taint::new(key, "x", TaintEffect::NoSchedule)];
            assert!(validate_taints(&taints).is_err(), "key {key:?} should be rejected");
        }
        let long = "x".repeat(64);
        assert!(validate_taints(&[Taint::new(long.clone(), "", TaintEffect::NoSchedule)]).is_err());
        assert!(validate_taints(&[Taint::new("role", long, TaintEffect::NoSchedule)]).is_err());
        assert!(validate_taints(&[Taint::new("role", "bad value", TaintEffect::NoSchedule)]).is_err());
    }

    #[test]
    fn well_formed_taints_pass() {
        let taints = vec![
            Taint::new("node.example.com/role", "ingress", TaintEffect::NoSchedule),
            Taint::new("nginx", "true", TaintEffect::NoSchedule),
            Taint::new("dedicated", "", TaintEffect::PreferNoSchedule),
        ];
        assert!(validate_taints(&taints).is_ok());
    }

    #[test]
    fn taint_display_uses_key_value_effect() {
        assert_eq!(ingress_taint().to_string(), "role=ingress:NoSchedule");
    }
}
