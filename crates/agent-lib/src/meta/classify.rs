//! Container role heuristics

use crate::engine::EngineDetailContainer;
use crate::models::ContainerRole;
use k8s_openapi::api::core::v1::Pod as K8sPod;
use std::collections::HashSet;

pub const ENV_IS_SIDECAR: &str = "IS_SIDECAR";
const SIDECAR_SUFFIX: &str = "-sidecar";

pub fn default_sidecar_names() -> Vec<String> {
    ["istio-proxy", "istio-init", "linkerd-proxy", "envoy", "mosn"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone)]
pub struct RoleClassifier {
    sidecar_names: HashSet<String>,
}

impl Default for RoleClassifier {
    fn default() -> Self {
        Self::new(default_sidecar_names())
    }
}

impl RoleClassifier {
    pub fn new(sidecar_names: impl IntoIterator<Item = String>) -> Self {
        Self {
            sidecar_names: sidecar_names.into_iter().collect(),
        }
    }

    pub fn classify(&self, detail: &EngineDetailContainer) -> ContainerRole {
        if detail.is_sandbox {
            return ContainerRole::Sandbox;
        }
        let name = detail.k8s_container_name();
        let flagged = detail
            .env
            .get(ENV_IS_SIDECAR)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        if flagged || self.sidecar_names.contains(name) || name.ends_with(SIDECAR_SUFFIX) {
            ContainerRole::Sidecar
        } else {
            ContainerRole::Biz
        }
    }
}

/// Names of the pod's init containers
pub fn init_container_names(pod: &K8sPod) -> HashSet<String> {
    pod.spec
        .as_ref()
        .and_then(|s| s.init_containers.as_ref())
        .map(|cs| cs.iter().map(|c| c.name.clone()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::labels;

    fn detail(name: &str) -> EngineDetailContainer {
        let mut d = EngineDetailContainer::default();
        d.labels
            .insert(labels::CONTAINER_NAME.to_string(), name.to_string());
        d
    }

    #[test]
    fn test_roles() {
        let classifier = RoleClassifier::default();

        assert_eq!(classifier.classify(&detail("web")), ContainerRole::Biz);
        assert_eq!(classifier.classify(&detail("istio-proxy")), ContainerRole::Sidecar);
        assert_eq!(classifier.classify(&detail("log-sidecar")), ContainerRole::Sidecar);

        let mut flagged = detail("agent");
        flagged.env.insert(ENV_IS_SIDECAR.into(), "TRUE".into());
        assert_eq!(classifier.classify(&flagged), ContainerRole::Sidecar);

        let mut sandbox = detail("POD");
        sandbox.is_sandbox = true;
        assert_eq!(classifier.classify(&sandbox), ContainerRole::Sandbox);
    }

    #[test]
    fn test_custom_names() {
        let classifier = RoleClassifier::new(vec!["fluent-bit".to_string()]);
        assert_eq!(classifier.classify(&detail("fluent-bit")), ContainerRole::Sidecar);
        assert_eq!(classifier.classify(&detail("envoy")), ContainerRole::Biz);
    }
}
