use std::collections::HashMap;
use std::path::Path;

use ndarray::Array2;

use crate::error::CorpusError;
use crate::TOKEN_FEATURE_WIDTH;

/// Phone → articulatory feature vector lookup.
#[derive(Debug, Clone, Default)]
pub struct FeatureTable {
    rows: HashMap<char, Vec<f32>>,
}

impl FeatureTable {
    /// Load a table from a JSON file.
    ///
    /// The file must contain a `"features"` object mapping single-character
    /// phone strings to arrays of `TOKEN_FEATURE_WIDTH` numbers.
    pub fn load(path: &Path) -> Result<Self, CorpusError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, CorpusError> {
        let json: serde_json::Value = serde_json::from_str(content)?;

        let features = json
            .get("features")
            .ok_or_else(|| CorpusError::Config("Missing 'features' field".to_string()))?
            .as_object()
            .ok_or_else(|| CorpusError::Config("'features' must be an object".to_string()))?;

        let mut rows = HashMap::new();
        for (k, v) in features {
            let mut chars = k.chars();
            let ch = match (chars.next(), chars.next()) {
                (Some(ch), None) => ch,
                _ => {
                    return Err(CorpusError::Config(format!(
                        "Feature key must be a single character: {k:?}"
                    )))
                }
            };
            let values = v
                .as_array()
                .ok_or_else(|| CorpusError::Config(format!("Features for {k:?} must be an array")))?
                .iter()
                .map(|x| x.as_f64().map(|f| f as f32))
                .collect::<Option<Vec<f32>>>()
                .ok_or_else(|| CorpusError::Config(format!("Non-numeric feature for {k:?}")))?;
            if values.len() != TOKEN_FEATURE_WIDTH {
                return Err(CorpusError::Config(format!(
                    "Features for {k:?} have width {}, expected {TOKEN_FEATURE_WIDTH}",
                    values.len()
                )));
            }
            rows.insert(ch, values);
        }

        Ok(Self { rows })
    }

    pub fn insert(&mut self, phone: char, features: Vec<f32>) {
        self.rows.insert(phone, features);
    }

    pub fn contains(&self, phone: char) -> bool {
        self.rows.contains_key(&phone)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Stack the rows of all known phones; unknown phones are skipped.
    pub fn lookup(&self, phones: impl IntoIterator<Item = char>) -> Array2<f32> {
        let mut flat = Vec::new();
        let mut count = 0usize;
        for phone in phones {
            if let Some(row) = self.rows.get(&phone) {
                flat.extend_from_slice(row);
                count += 1;
            } else {
                log::debug!("No features for phone {phone:?}, skipping");
            }
        }
        // Every stored row has TOKEN_FEATURE_WIDTH entries.
        Array2::from_shape_vec((count, TOKEN_FEATURE_WIDTH), flat)
            .unwrap_or_else(|_| Array2::zeros((0, TOKEN_FEATURE_WIDTH)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(v: f32) -> String {
        let values: Vec<String> = (0..TOKEN_FEATURE_WIDTH).map(|_| v.to_string()).collect();
        format!("[{}]", values.join(","))
    }

    #[test]
    fn loads_rows_and_looks_up_phones() {
        let json = format!(r#"{{"features": {{"a": {}, "b": {}}}}}"#, row(1.0), row(2.0));
        let table = FeatureTable::from_json(&json).expect("valid table");
        assert_eq!(table.len(), 2);

        let tokens = table.lookup("abxa".chars());
        assert_eq!(tokens.dim(), (3, TOKEN_FEATURE_WIDTH));
        assert_eq!(tokens[[1, 0]], 2.0);
        assert_eq!(tokens[[2, 65]], 1.0);
    }

    #[test]
    fn rejects_wrong_width() {
        let json = r#"{"features": {"a": [1.0, 2.0]}}"#;
        assert!(matches!(
            FeatureTable::from_json(json),
            Err(CorpusError::Config(_))
        ));
    }

    #[test]
    fn rejects_multi_char_keys() {
        let json = format!(r#"{{"features": {{"ab": {}}}}}"#, row(0.0));
        assert!(FeatureTable::from_json(&json).is_err());
    }
}
