// Copyright (c), Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

// Pre-fitted classifiers exported from the offline training step.
// Each artifact bundles the standard scaler, optional label encoders and the
// random forest trees for one disease.

use crate::InsightsError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Marks a leaf in `children_left`.
const TREE_LEAF: i64 = -1;

// ============================================
// Diseases
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disease {
    Diabetes,
    Heart,
    Lung,
    Parkinsons,
    Liver,
}

impl Disease {
    pub const ALL: [Disease; 5] = [
        Disease::Diabetes,
        Disease::Heart,
        Disease::Lung,
        Disease::Parkinsons,
        Disease::Liver,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Disease::Diabetes => "diabetes",
            Disease::Heart => "heart",
            Disease::Lung => "lung",
            Disease::Parkinsons => "parkinsons",
            Disease::Liver => "liver",
        }
    }

    /// Number of form values the fitted model was trained on.
    pub fn expected_inputs(&self) -> usize {
        match self {
            Disease::Diabetes => 8,
            Disease::Heart => 13,
            Disease::Lung => 15,
            Disease::Parkinsons => 22,
            Disease::Liver => 10,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Disease::Diabetes => "Diabetes",
            Disease::Heart => "Heart",
            Disease::Lung => "Lung",
            Disease::Parkinsons => "Parkinsons",
            Disease::Liver => "Liver",
        }
    }

    pub fn artifact_file(&self) -> String {
        format!("{}_model.json", self.as_str())
    }
}

impl fmt::Display for Disease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Disease {
    type Err = InsightsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase();
        Disease::ALL
            .into_iter()
            .find(|d| d.as_str() == name)
            .ok_or_else(|| InsightsError::GenericError(format!("Unsupported disease type: {name}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Diagnosis {
    Positive,
    Negative,
}

impl fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnosis::Positive => f.write_str("Positive"),
            Diagnosis::Negative => f.write_str("Negative"),
        }
    }
}

// ============================================
// Artifact format
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    pub fn transform(&self, values: &[f64]) -> Vec<f64> {
        values
            .iter()
            .zip(self.mean.iter().zip(self.scale.iter()))
            .map(|(x, (mean, scale))| {
                let scale = if *scale == 0.0 { 1.0 } else { *scale };
                (x - mean) / scale
            })
            .collect()
    }
}

/// Flattened decision tree, node arrays indexed by node id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    pub children_left: Vec<i64>,
    pub children_right: Vec<i64>,
    pub feature: Vec<i64>,
    pub threshold: Vec<f64>,
    /// Per-class weights at each node.
    pub value: Vec<Vec<f64>>,
}

impl DecisionTree {
    fn validate(&self, n_features: usize, n_classes: usize) -> Result<(), String> {
        let n = self.children_left.len();
        if n == 0 {
            return Err("tree has no nodes".to_string());
        }
        if self.children_right.len() != n
            || self.feature.len() != n
            || self.threshold.len() != n
            || self.value.len() != n
        {
            return Err("tree node arrays have mismatched lengths".to_string());
        }
        for node in 0..n {
            let (left, right) = (self.children_left[node], self.children_right[node]);
            if left == TREE_LEAF {
                if self.value[node].len() != n_classes {
                    return Err(format!(
                        "leaf {node} has {} class weights, expected {n_classes}",
                        self.value[node].len()
                    ));
                }
                continue;
            }
            for child in [left, right] {
                if child <= node as i64 || child as usize >= n {
                    return Err(format!("node {node} has invalid child index {child}"));
                }
            }
            let feature = self.feature[node];
            if feature < 0 || feature as usize >= n_features {
                return Err(format!("node {node} splits on unknown feature {feature}"));
            }
        }
        Ok(())
    }

    /// Normalised class distribution of the leaf reached by `x`.
    fn leaf_distribution(&self, x: &[f64]) -> Vec<f64> {
        let mut node = 0usize;
        while self.children_left[node] != TREE_LEAF {
            let feature = self.feature[node] as usize;
            node = if x[feature] <= self.threshold[node] {
                self.children_left[node] as usize
            } else {
                self.children_right[node] as usize
            };
        }
        let weights = &self.value[node];
        let total: f64 = weights.iter().sum();
        if total > 0.0 {
            weights.iter().map(|w| w / total).collect()
        } else {
            weights.clone()
        }
    }
}

/// On-disk model artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    #[serde(default)]
    pub features: Vec<String>,
    pub scaler: StandardScaler,
    /// Feature name -> sorted label-encoder classes.
    #[serde(default)]
    pub encoders: HashMap<String, Vec<String>>,
    pub classes: Vec<Value>,
    #[serde(default)]
    pub positive_class: Option<Value>,
    pub trees: Vec<DecisionTree>,
}

// ============================================
// Classifier
// ============================================

#[derive(Debug, Clone)]
pub struct Classifier {
    disease: Disease,
    artifact: ModelArtifact,
    positive_class: Value,
}

impl Classifier {
    pub fn from_artifact(disease: Disease, artifact: ModelArtifact) -> Result<Self, InsightsError> {
        let invalid = |msg: String| {
            InsightsError::ModelError(format!("Invalid {} model artifact: {msg}", disease))
        };

        let n_features = disease.expected_inputs();
        if artifact.scaler.mean.len() != n_features || artifact.scaler.scale.len() != n_features {
            return Err(invalid(format!(
                "scaler covers {} features, expected {n_features}",
                artifact.scaler.mean.len()
            )));
        }
        if !artifact.features.is_empty() && artifact.features.len() != n_features {
            return Err(invalid(format!(
                "{} feature names, expected {n_features}",
                artifact.features.len()
            )));
        }
        if artifact.classes.is_empty() {
            return Err(invalid("no classes".to_string()));
        }
        if artifact.trees.is_empty() {
            return Err(invalid("no trees".to_string()));
        }
        for (i, tree) in artifact.trees.iter().enumerate() {
            tree.validate(n_features, artifact.classes.len())
                .map_err(|e| invalid(format!("tree {i}: {e}")))?;
        }

        let positive_class = artifact
            .positive_class
            .clone()
            .unwrap_or_else(|| Value::from(1));

        Ok(Self {
            disease,
            artifact,
            positive_class,
        })
    }

    pub fn load(disease: Disease, path: &Path) -> Result<Self, InsightsError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            InsightsError::ModelError(format!("Failed to read {}: {e}", path.display()))
        })?;
        let artifact: ModelArtifact = serde_json::from_str(&raw).map_err(|e| {
            InsightsError::ModelError(format!("Failed to parse {}: {e}", path.display()))
        })?;
        Self::from_artifact(disease, artifact)
    }

    pub fn disease(&self) -> Disease {
        self.disease
    }

    /// Coerce submitted form values, in submission order, into model inputs.
    pub fn feature_vector(&self, input: &Map<String, Value>) -> Result<Vec<f64>, InsightsError> {
        input
            .iter()
            .enumerate()
            .map(|(i, (key, value))| self.coerce(i, key, value))
            .collect()
    }

    fn coerce(&self, index: usize, key: &str, value: &Value) -> Result<f64, InsightsError> {
        let invalid = || InsightsError::GenericError(format!("Invalid value for {key}: {value}"));
        match value {
            Value::Number(n) => n.as_f64().ok_or_else(invalid),
            Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => {
                let s = s.trim();
                if let Ok(v) = s.parse::<f64>() {
                    return Ok(v);
                }
                let feature_name = self
                    .artifact
                    .features
                    .get(index)
                    .map(String::as_str)
                    .unwrap_or(key);
                self.artifact
                    .encoders
                    .get(feature_name)
                    .or_else(|| self.artifact.encoders.get(key))
                    .and_then(|classes| classes.iter().position(|c| c == s))
                    .map(|pos| pos as f64)
                    .ok_or_else(invalid)
            }
            _ => Err(invalid()),
        }
    }

    /// Scale the inputs and take the forest's majority-probability class.
    pub fn predict(&self, values: &[f64]) -> Result<Diagnosis, InsightsError> {
        let expected = self.disease.expected_inputs();
        if values.len() != expected {
            return Err(InsightsError::GenericError(format!(
                "{} model expects {} input values, but got {}",
                self.disease.display_name(),
                expected,
                values.len()
            )));
        }

        let scaled = self.artifact.scaler.transform(values);
        let mut proba = vec![0.0; self.artifact.classes.len()];
        for tree in &self.artifact.trees {
            for (p, w) in proba.iter_mut().zip(tree.leaf_distribution(&scaled)) {
                *p += w;
            }
        }

        // First maximum wins ties.
        let mut best = 0;
        for (i, p) in proba.iter().enumerate() {
            if *p > proba[best] {
                best = i;
            }
        }

        let label = &self.artifact.classes[best];
        Ok(if labels_match(label, &self.positive_class) {
            Diagnosis::Positive
        } else {
            Diagnosis::Negative
        })
    }
}

fn labels_match(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::String(x), Value::String(y)) => x.trim().eq_ignore_ascii_case(y.trim()),
        (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
            s.trim().parse::<f64>().ok() == n.as_f64()
        }
        _ => a == b,
    }
}

// ============================================
// Registry
// ============================================

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<Disease, Classifier>,
}

impl ModelRegistry {
    /// Load every disease's artifact from `dir`; all of them must be present.
    pub fn load_dir(dir: &Path) -> Result<Self, InsightsError> {
        let mut models = HashMap::new();
        for disease in Disease::ALL {
            let path = dir.join(disease.artifact_file());
            let classifier = Classifier::load(disease, &path)?;
            info!(
                "Loaded {} model ({} trees) from {}",
                disease,
                classifier.artifact.trees.len(),
                path.display()
            );
            models.insert(disease, classifier);
        }
        Ok(Self { models })
    }

    pub fn from_models(models: impl IntoIterator<Item = Classifier>) -> Self {
        Self {
            models: models.into_iter().map(|m| (m.disease(), m)).collect(),
        }
    }

    pub fn get(&self, disease: Disease) -> Result<&Classifier, InsightsError> {
        self.models.get(&disease).ok_or_else(|| {
            InsightsError::ModelError(format!("No model loaded for {disease}"))
        })
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use serde_json::json;

    /// Single-stump forest splitting on feature `split` at raw value `cut`.
    pub(crate) fn stump_artifact(disease: Disease, split: usize, cut: f64) -> ModelArtifact {
        let n = disease.expected_inputs();
        let mut mean = vec![0.0; n];
        mean[split] = cut;
        ModelArtifact {
            features: Vec::new(),
            scaler: StandardScaler {
                mean,
                scale: vec![1.0; n],
            },
            encoders: HashMap::new(),
            classes: vec![json!(0), json!(1)],
            positive_class: None,
            trees: vec![DecisionTree {
                children_left: vec![1, -1, -1],
                children_right: vec![2, -1, -1],
                feature: vec![split as i64, -2, -2],
                threshold: vec![0.0, -2.0, -2.0],
                value: vec![vec![5.0, 5.0], vec![10.0, 0.0], vec![0.0, 10.0]],
            }],
        }
    }

    #[test]
    fn test_disease_parsing() {
        assert_eq!(" Diabetes ".parse::<Disease>().unwrap(), Disease::Diabetes);
        assert_eq!("PARKINSONS".parse::<Disease>().unwrap(), Disease::Parkinsons);
        let err = "kidney".parse::<Disease>().unwrap_err();
        assert_eq!(err.to_string(), "Unsupported disease type: kidney");
    }

    #[test]
    fn test_expected_inputs() {
        let counts: Vec<usize> = Disease::ALL.iter().map(|d| d.expected_inputs()).collect();
        assert_eq!(counts, vec![8, 13, 15, 22, 10]);
    }

    #[test]
    fn test_stump_prediction() {
        let model =
            Classifier::from_artifact(Disease::Diabetes, stump_artifact(Disease::Diabetes, 1, 140.0))
                .unwrap();
        let mut values = vec![1.0; 8];
        values[1] = 180.0;
        assert_eq!(model.predict(&values).unwrap(), Diagnosis::Positive);
        values[1] = 90.0;
        assert_eq!(model.predict(&values).unwrap(), Diagnosis::Negative);
        // Threshold is inclusive on the left branch.
        values[1] = 140.0;
        assert_eq!(model.predict(&values).unwrap(), Diagnosis::Negative);
    }

    #[test]
    fn test_forest_averages_probabilities() {
        let mut artifact = stump_artifact(Disease::Heart, 0, 50.0);
        // Second tree always leans negative, but weakly.
        artifact.trees.push(DecisionTree {
            children_left: vec![-1],
            children_right: vec![-1],
            feature: vec![-2],
            threshold: vec![-2.0],
            value: vec![vec![6.0, 4.0]],
        });
        let model = Classifier::from_artifact(Disease::Heart, artifact).unwrap();

        let mut values = vec![0.0; 13];
        values[0] = 70.0;
        // (0 + 0.6) / 2 vs (1 + 0.4) / 2
        assert_eq!(model.predict(&values).unwrap(), Diagnosis::Positive);
    }

    #[test]
    fn test_string_positive_class() {
        let mut artifact = stump_artifact(Disease::Lung, 2, 1.5);
        artifact.classes = vec![json!("NO"), json!("YES")];
        artifact.positive_class = Some(json!("yes"));
        let model = Classifier::from_artifact(Disease::Lung, artifact).unwrap();

        let mut values = vec![1.0; 15];
        values[2] = 2.0;
        assert_eq!(model.predict(&values).unwrap(), Diagnosis::Positive);
    }

    #[test]
    fn test_zero_scale_is_identity() {
        let scaler = StandardScaler {
            mean: vec![1.0, 2.0],
            scale: vec![0.0, 2.0],
        };
        assert_eq!(scaler.transform(&[3.0, 6.0]), vec![2.0, 2.0]);
    }

    #[test]
    fn test_feature_vector_coercion() {
        let mut artifact = stump_artifact(Disease::Liver, 0, 40.0);
        artifact.features = (0..10).map(|i| format!("f{i}")).collect();
        artifact.features[1] = "Gender".to_string();
        artifact
            .encoders
            .insert("Gender".to_string(), vec!["Female".to_string(), "Male".to_string()]);
        let model = Classifier::from_artifact(Disease::Liver, artifact).unwrap();

        let input = json!({
            "Age": "45",
            "Gender": "Male",
            "TB": 0.7,
            "DB": true,
        });
        let values = model.feature_vector(input.as_object().unwrap()).unwrap();
        assert_eq!(values, vec![45.0, 1.0, 0.7, 1.0]);

        let bad = json!({ "Age": "forty" });
        let err = model.feature_vector(bad.as_object().unwrap()).unwrap_err();
        assert!(err.to_string().contains("Invalid value for Age"));
    }

    #[test]
    fn test_wrong_input_count() {
        let model =
            Classifier::from_artifact(Disease::Parkinsons, stump_artifact(Disease::Parkinsons, 0, 0.0))
                .unwrap();
        let err = model.predict(&[1.0; 5]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Parkinsons model expects 22 input values, but got 5"
        );
    }

    #[test]
    fn test_rejects_invalid_artifacts() {
        let mut short_scaler = stump_artifact(Disease::Diabetes, 0, 0.0);
        short_scaler.scaler.mean.pop();
        assert!(Classifier::from_artifact(Disease::Diabetes, short_scaler).is_err());

        let mut backwards = stump_artifact(Disease::Diabetes, 0, 0.0);
        backwards.trees[0].children_left[0] = 0;
        assert!(Classifier::from_artifact(Disease::Diabetes, backwards).is_err());

        let mut bad_feature = stump_artifact(Disease::Diabetes, 0, 0.0);
        bad_feature.trees[0].feature[0] = 8;
        assert!(Classifier::from_artifact(Disease::Diabetes, bad_feature).is_err());

        let mut no_trees = stump_artifact(Disease::Diabetes, 0, 0.0);
        no_trees.trees.clear();
        assert!(Classifier::from_artifact(Disease::Diabetes, no_trees).is_err());

        let mut ragged = stump_artifact(Disease::Diabetes, 0, 0.0);
        ragged.trees[0].threshold.pop();
        let err = Classifier::from_artifact(Disease::Diabetes, ragged).unwrap_err();
        assert!(err.to_string().contains("mismatched lengths"));

        let mut short_leaf = stump_artifact(Disease::Diabetes, 0, 0.0);
        short_leaf.trees[0].value[1] = vec![1.0];
        let err = Classifier::from_artifact(Disease::Diabetes, short_leaf).unwrap_err();
        assert!(err.to_string().contains("leaf 1 has 1 class weights, expected 2"));
    }

    #[test]
    fn test_registry_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        for disease in Disease::ALL {
            let artifact = stump_artifact(disease, 0, 1.0);
            std::fs::write(
                dir.path().join(disease.artifact_file()),
                serde_json::to_string(&artifact).unwrap(),
            )
            .unwrap();
        }
        let registry = ModelRegistry::load_dir(dir.path()).unwrap();
        assert_eq!(registry.len(), 5);
        assert!(registry.get(Disease::Liver).is_ok());

        std::fs::remove_file(dir.path().join("lung_model.json")).unwrap();
        let err = ModelRegistry::load_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("lung_model.json"));
    }
}
