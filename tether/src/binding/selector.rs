use std::collections::BTreeMap;

use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};

/// A conjunction of `key == value` constraints over a label set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector(BTreeMap<String, String>);

impl Selector {
    /// Selector of a deployment, taken from `spec.selector.matchLabels`.
    ///
    /// Returns `None` when the selector cannot be expressed as equality
    /// constraints: it uses `matchExpressions` or has no labels at all.
    pub fn of_deployment(deployment: &Deployment) -> Option<Self> {
        let selector = &deployment.spec.as_ref()?.selector;
        if selector.match_expressions.as_ref().is_some_and(|expressions| !expressions.is_empty()) {
            return None;
        }
        selector.match_labels.clone().filter(|labels| !labels.is_empty()).map(Self)
    }

    /// Selector of a service, taken from `spec.selector`.
    pub fn of_service(service: &Service) -> Self {
        service.spec.as_ref().and_then(|spec| spec.selector.clone()).map(Self).unwrap_or_default()
    }

    /// Returns `true` if every constraint holds in `labels`.
    ///
    /// The empty selector matches every label set.
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.0.iter().all(|(key, value)| labels.and_then(|labels| labels.get(key)) == Some(value))
    }

    /// Constraint pairs that `labels` lacks, either because the key is absent
    /// or because it carries a different value.
    pub fn missing_from(&self, labels: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
        self.0
            .iter()
            .filter(|(key, value)| labels.and_then(|labels| labels.get(*key)) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

impl From<BTreeMap<String, String>> for Selector {
    fn from(constraints: BTreeMap<String, String>) -> Self { Self(constraints) }
}

impl<K, V> FromIterator<(K, V)> for Selector
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(key, value)| (key.into(), value.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(key, value)| ((*key).to_string(), (*value).to_string())).collect()
    }

    #[test]
    fn test_matches_requires_every_pair() {
        let selector: Selector = [("app", "a"), ("tier", "web")].into_iter().collect();
        assert!(selector.matches(Some(&labels(&[("app", "a"), ("tier", "web"), ("x", "y")]))));
        assert!(!selector.matches(Some(&labels(&[("app", "a")]))));
        assert!(!selector.matches(Some(&labels(&[("app", "b"), ("tier", "web")]))));
        assert!(!selector.matches(None));
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector = Selector::default();
        assert!(selector.matches(None));
        assert!(selector.matches(Some(&labels(&[("app", "a")]))));
    }

    #[test]
    fn test_deployment_selector_requires_equality_labels() {
        let mut deployment = Deployment::default();
        assert_eq!(Selector::of_deployment(&deployment), None);

        let selector = &mut deployment.spec.get_or_insert_default().selector;
        selector.match_labels = Some(labels(&[("app", "a")]));
        assert_eq!(
            Selector::of_deployment(&deployment),
            Some([("app", "a")].into_iter().collect())
        );

        deployment.spec.get_or_insert_default().selector.match_expressions =
            Some(vec![LabelSelectorRequirement {
                key: "tier".to_string(),
                operator: "Exists".to_string(),
                values: None,
            }]);
        assert_eq!(Selector::of_deployment(&deployment), None);

        deployment.spec.get_or_insert_default().selector =
            LabelSelector { match_labels: Some(BTreeMap::new()), match_expressions: None };
        assert_eq!(Selector::of_deployment(&deployment), None);
    }

    #[test]
    fn test_missing_from_reports_absent_and_different_values() {
        let selector: Selector =
            [("app", "a"), ("workloadID_svc", "true"), ("tier", "web")].into_iter().collect();
        let missing = selector.missing_from(Some(&labels(&[("app", "a"), ("tier", "db")])));
        assert_eq!(missing, labels(&[("tier", "web"), ("workloadID_svc", "true")]));
        let complete = labels(&[("app", "a"), ("workloadID_svc", "true"), ("tier", "web")]);
        assert!(selector.missing_from(Some(&complete)).is_empty());
    }
}
