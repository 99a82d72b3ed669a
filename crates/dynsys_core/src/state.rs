use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Immutable snapshot of a dynamic system: the independent variable plus
/// one value per state variable.
///
/// Variable names are shared between all snapshots of a run, so producing a
/// new state per step only allocates the value vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DynamicSystemState {
    independent: f64,
    names: Arc<[String]>,
    values: Arc<[f64]>,
}

impl DynamicSystemState {
    /// Creates a state at `independent`. Variables are stored sorted by
    /// name; a repeated name keeps its last value.
    pub fn at<I, K>(independent: f64, variables: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        let sorted: BTreeMap<String, f64> = variables
            .into_iter()
            .map(|(name, value)| (name.into(), value))
            .collect();
        let (names, values): (Vec<String>, Vec<f64>) = sorted.into_iter().unzip();
        Self {
            independent,
            names: names.into(),
            values: values.into(),
        }
    }

    pub(crate) fn from_parts(independent: f64, names: Arc<[String]>, values: &[f64]) -> Self {
        debug_assert_eq!(names.len(), values.len());
        Self {
            independent,
            names,
            values: values.into(),
        }
    }

    pub fn independent(&self) -> f64 {
        self.independent
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|idx| self.values[idx])
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }

    /// Values rearranged into `order`, or `None` when the variable sets differ.
    pub fn values_in_order(&self, order: &[String]) -> Option<Vec<f64>> {
        if order.len() != self.names.len() {
            return None;
        }
        order.iter().map(|name| self.get(name)).collect()
    }
}

impl fmt::Display for DynamicSystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.independent)?;
        for (name, value) in self.iter() {
            write!(f, " {}={}", name, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_sorts_variables_by_name() {
        let state = DynamicSystemState::at(0.5, [("y", 2.0), ("x", 1.0)]);
        assert_eq!(state.names(), &["x".to_string(), "y".to_string()]);
        assert_eq!(state.values(), &[1.0, 2.0]);
        assert_eq!(state.get("y"), Some(2.0));
        assert_eq!(state.get("z"), None);
        assert_eq!(state.to_string(), "[0.5] x=1 y=2");
    }

    #[test]
    fn values_in_order_requires_matching_sets() {
        let state = DynamicSystemState::at(0.0, [("a", 1.0), ("b", 2.0)]);
        let order = vec!["b".to_string(), "a".to_string()];
        assert_eq!(state.values_in_order(&order), Some(vec![2.0, 1.0]));

        let missing = vec!["b".to_string(), "c".to_string()];
        assert_eq!(state.values_in_order(&missing), None);
        assert_eq!(state.values_in_order(&order[..1]), None);
    }
}
