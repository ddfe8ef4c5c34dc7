//! Structured clinical risk factors and their encoder.
//!
//! Fields are encoded in schema order. A field that is absent or explicitly `Missing`
//! contributes a learned per-field "missing" embedding plus an indicator channel set
//! to one, so an unobserved value can never be mistaken for an observed one.

use crate::nn::{Linear, Trainable, init_matrix, init_vector, relu_backward};
use ahash::AHashMap;
use ndarray::{Array1, Array2, ArrayViewD, ArrayViewMutD, s};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RiskFactorError {
    #[error("risk factor '{0}' is not part of the configured schema")]
    UnknownField(String),
    #[error("risk factor '{field}' has invalid value {value}: {reason}")]
    InvalidValue {
        field: String,
        value: f64,
        reason: &'static str,
    },
    #[error("risk factor schema is invalid: {0}")]
    InvalidSchema(String),
    #[error("risk factor encoder expects {expected} fields, resolved vector has {found}")]
    FieldCountMismatch { expected: usize, found: usize },
}

/// How a field's observed value is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Binary,
    /// Standardized as `(value - mean) / std` before the learned affine embedding.
    Continuous { mean: f64, std: f64 },
    /// Integer level in `0..levels`.
    Categorical { levels: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Ordered list of risk-factor fields. The order here, not input order, drives encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactorSchema {
    pub fields: Vec<FieldSpec>,
}

impl RiskFactorSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn validate(&self) -> Result<(), RiskFactorError> {
        let mut seen = AHashMap::with_capacity(self.fields.len());
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(RiskFactorError::InvalidSchema("empty field name".into()));
            }
            if seen.insert(field.name.as_str(), ()).is_some() {
                return Err(RiskFactorError::InvalidSchema(format!(
                    "field '{}' is listed twice",
                    field.name
                )));
            }
            match field.kind {
                FieldKind::Continuous { mean, std } if !(mean.is_finite() && std > 0.0) => {
                    return Err(RiskFactorError::InvalidSchema(format!(
                        "field '{}' needs a finite mean and positive std",
                        field.name
                    )));
                }
                FieldKind::Categorical { levels } if levels < 2 => {
                    return Err(RiskFactorError::InvalidSchema(format!(
                        "field '{}' needs at least two levels",
                        field.name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Checks every supplied field against the schema and lays values out in schema order.
    pub fn resolve(&self, vector: &RiskFactorVector) -> Result<ResolvedRiskFactors, RiskFactorError> {
        for name in vector.values.keys() {
            if self.position(name).is_none() {
                return Err(RiskFactorError::UnknownField(name.clone()));
            }
        }
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let resolved = match vector.values.get(&field.name) {
                None | Some(RiskFactorValue::Missing) => None,
                Some(RiskFactorValue::Observed(v)) => Some(check_value(field, *v)?),
            };
            values.push(resolved);
        }
        Ok(ResolvedRiskFactors { values })
    }
}

fn check_value(field: &FieldSpec, value: f64) -> Result<f64, RiskFactorError> {
    let invalid = |reason| RiskFactorError::InvalidValue {
        field: field.name.clone(),
        value,
        reason,
    };
    if !value.is_finite() {
        return Err(invalid("value must be finite"));
    }
    match field.kind {
        FieldKind::Binary if value != 0.0 && value != 1.0 => Err(invalid("binary fields take 0 or 1")),
        FieldKind::Categorical { levels }
            if value.fract() != 0.0 || value < 0.0 || value >= levels as f64 =>
        {
            Err(invalid("categorical level out of range"))
        }
        _ => Ok(value),
    }
}

/// A single field value as supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RiskFactorValue {
    Observed(f64),
    Missing,
}

/// Named field values for one exam; fields not present are treated as missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskFactorVector {
    values: AHashMap<String, RiskFactorValue>,
}

impl RiskFactorVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: RiskFactorValue) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: RiskFactorValue) {
        self.values.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<RiskFactorValue> {
        self.values.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<RiskFactorValue> {
        self.values.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Values in schema order; `None` marks a missing field.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRiskFactors {
    values: Vec<Option<f64>>,
}

impl ResolvedRiskFactors {
    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    pub fn all_missing(fields: usize) -> Self {
        Self {
            values: vec![None; fields],
        }
    }

    pub fn missing_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_none()).count()
    }
}

/// Learned embedding for one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEncoder {
    pub kind: FieldKind,
    /// Binary: one row per value. Categorical: one row per level.
    /// Continuous: row 0 is the slope, row 1 the offset.
    pub table: Array2<f64>,
    pub missing: Array1<f64>,
}

impl FieldEncoder {
    fn new<R: Rng + ?Sized>(kind: &FieldKind, dim: usize, rng: &mut R) -> Self {
        let rows = match kind {
            FieldKind::Binary | FieldKind::Continuous { .. } => 2,
            FieldKind::Categorical { levels } => *levels,
        };
        Self {
            kind: kind.clone(),
            table: init_matrix(rows, dim, dim, rng),
            missing: init_vector(dim, 1.0, rng),
        }
    }

    fn embed(&self, value: Option<f64>) -> Array1<f64> {
        match (value, &self.kind) {
            (None, _) => self.missing.clone(),
            (Some(v), FieldKind::Continuous { mean, std }) => {
                let z = (v - mean) / std;
                &self.table.row(0) * z + &self.table.row(1)
            }
            (Some(v), _) => self.table.row(v as usize).to_owned(),
        }
    }

    fn backward(&self, value: Option<f64>, grad: ndarray::ArrayView1<f64>, grads: &mut FieldEncoder) {
        match (value, &self.kind) {
            (None, _) => grads.missing += &grad,
            (Some(v), FieldKind::Continuous { mean, std }) => {
                let z = (v - mean) / std;
                grads.table.row_mut(0).scaled_add(z, &grad);
                grads.table.row_mut(1).scaled_add(1.0, &grad);
            }
            (Some(v), _) => grads.table.row_mut(v as usize).scaled_add(1.0, &grad),
        }
    }
}

impl Trainable for FieldEncoder {
    fn params(&self) -> Vec<ArrayViewD<'_, f64>> {
        vec![self.table.view().into_dyn(), self.missing.view().into_dyn()]
    }

    fn params_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        vec![self.table.view_mut().into_dyn(), self.missing.view_mut().into_dyn()]
    }
}

/// Encodes a resolved risk-factor vector as `[relu(fusion(concat)) ; missing indicators]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactorEncoder {
    pub fields: Vec<FieldEncoder>,
    pub fusion: Linear,
    pub field_dim: usize,
}

/// Intermediate values kept for the backward pass.
#[derive(Debug, Clone)]
pub struct RiskFactorTrace {
    resolved: ResolvedRiskFactors,
    concat: Array1<f64>,
    pre: Array1<f64>,
}

impl RiskFactorEncoder {
    pub fn new<R: Rng + ?Sized>(schema: &RiskFactorSchema, field_dim: usize, output_dim: usize, rng: &mut R) -> Self {
        let fields = schema
            .fields
            .iter()
            .map(|f| FieldEncoder::new(&f.kind, field_dim, rng))
            .collect::<Vec<_>>();
        let fusion = Linear::new(fields.len() * field_dim, output_dim, rng);
        Self {
            fields,
            fusion,
            field_dim,
        }
    }

    /// Width of the encoder output, fused embedding plus one indicator per field.
    pub fn output_dim(&self) -> usize {
        self.fusion.outputs() + self.fields.len()
    }

    pub fn encode(&self, resolved: &ResolvedRiskFactors) -> Result<Array1<f64>, RiskFactorError> {
        Ok(self.forward(resolved)?.0)
    }

    pub fn forward(&self, resolved: &ResolvedRiskFactors) -> Result<(Array1<f64>, RiskFactorTrace), RiskFactorError> {
        if resolved.values.len() != self.fields.len() {
            return Err(RiskFactorError::FieldCountMismatch {
                expected: self.fields.len(),
                found: resolved.values.len(),
            });
        }
        let mut concat = Array1::zeros(self.fields.len() * self.field_dim);
        for (i, (field, value)) in self.fields.iter().zip(&resolved.values).enumerate() {
            concat
                .slice_mut(s![i * self.field_dim..(i + 1) * self.field_dim])
                .assign(&field.embed(*value));
        }
        let pre = self.fusion.forward(concat.view());
        let fused = pre.mapv(crate::nn::relu);
        let indicators = resolved
            .values
            .iter()
            .map(|v| if v.is_none() { 1.0 } else { 0.0 });
        let output = fused.iter().copied().chain(indicators).collect::<Array1<f64>>();
        Ok((
            output,
            RiskFactorTrace {
                resolved: resolved.clone(),
                concat,
                pre,
            },
        ))
    }

    /// Accumulates gradients for an upstream gradient on the full encoder output.
    pub fn backward(&self, trace: &RiskFactorTrace, d_output: ndarray::ArrayView1<f64>, grads: &mut RiskFactorEncoder) {
        let fused_dim = self.fusion.outputs();
        let d_fused = d_output.slice(s![..fused_dim]).to_owned();
        let d_pre = relu_backward(&trace.pre, &d_fused);
        let d_concat = self
            .fusion
            .backward(trace.concat.view(), d_pre.view(), &mut grads.fusion);
        for (i, ((field, value), field_grads)) in self
            .fields
            .iter()
            .zip(trace.resolved.values.iter())
            .zip(grads.fields.iter_mut())
            .enumerate()
        {
            let slice = d_concat.slice(s![i * self.field_dim..(i + 1) * self.field_dim]);
            field.backward(*value, slice, field_grads);
        }
    }
}

impl Trainable for RiskFactorEncoder {
    fn params(&self) -> Vec<ArrayViewD<'_, f64>> {
        let mut params = Vec::new();
        for field in &self.fields {
            params.extend(field.params());
        }
        params.extend(self.fusion.params());
        params
    }

    fn params_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        let mut params = Vec::new();
        for field in &mut self.fields {
            params.extend(field.params_mut());
        }
        params.extend(self.fusion.params_mut());
        params
    }
}
