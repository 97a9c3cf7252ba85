//! Immutable pod graph snapshot and its indices

use crate::models::{short_id, Container, Pod, SHORT_ID_LEN};
use std::collections::HashMap;
use std::sync::Arc;

/// One reconciled view of the node
///
/// Pods live in an arena; every index points into it, so a container's owner
/// is found through `pod_by_uid` instead of a stored reference.
#[derive(Debug, Default)]
pub struct PodGraph {
    pods: Vec<Arc<Pod>>,
    pod_by_key: HashMap<String, usize>,
    pod_by_uid: HashMap<String, usize>,
    pod_by_sandbox_id: HashMap<String, usize>,
    pod_by_ip: HashMap<String, usize>,
    pod_by_hostname: HashMap<String, usize>,
    running_pods_by_key: HashMap<String, usize>,
    container_by_id: HashMap<String, Arc<Container>>,
    container_by_short_id: HashMap<String, Arc<Container>>,
}

impl PodGraph {
    pub fn build(pods: Vec<Arc<Pod>>) -> Self {
        let mut graph = PodGraph {
            pods,
            ..Default::default()
        };

        for (idx, pod) in graph.pods.iter().enumerate() {
            graph.pod_by_key.insert(pod.key(), idx);
            graph.pod_by_uid.insert(pod.uid.clone(), idx);
            if pod.is_running() {
                graph.running_pods_by_key.insert(pod.key(), idx);
            }
            if let Some(sandbox) = &pod.sandbox {
                graph.pod_by_sandbox_id.insert(sandbox.id.clone(), idx);
            }
            // Host-network pods share the node IP
            if !pod.uses_host_network() {
                if let Some(ip) = pod.ip().filter(|ip| !ip.is_empty()) {
                    graph.pod_by_ip.insert(ip.to_string(), idx);
                }
            }
            if let Some(hostname) = pod.hostname() {
                graph.pod_by_hostname.entry(hostname.to_string()).or_insert(idx);
            }
            for c in &pod.all {
                graph.container_by_id.insert(c.id.clone(), c.clone());
                graph
                    .container_by_short_id
                    .insert(c.short_id.clone(), c.clone());
            }
        }

        graph
    }

    pub fn pods(&self) -> &[Arc<Pod>] {
        &self.pods
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    pub fn container_count(&self) -> usize {
        self.container_by_id.len()
    }

    fn at(&self, idx: Option<&usize>) -> Option<&Arc<Pod>> {
        idx.and_then(|i| self.pods.get(*i))
    }

    pub fn get_pod(&self, namespace: &str, name: &str) -> Option<&Arc<Pod>> {
        self.get_pod_by_key(&format!("{namespace}/{name}"))
    }

    pub fn get_pod_by_key(&self, key: &str) -> Option<&Arc<Pod>> {
        self.at(self.pod_by_key.get(key))
    }

    pub fn get_pod_by_uid(&self, uid: &str) -> Option<&Arc<Pod>> {
        self.at(self.pod_by_uid.get(uid))
    }

    pub fn get_pod_by_sandbox_id(&self, sandbox_id: &str) -> Option<&Arc<Pod>> {
        self.at(self.pod_by_sandbox_id.get(sandbox_id))
    }

    pub fn get_pod_by_ip(&self, ip: &str) -> Option<&Arc<Pod>> {
        self.at(self.pod_by_ip.get(ip))
    }

    pub fn get_pod_by_hostname(&self, hostname: &str) -> Option<&Arc<Pod>> {
        self.at(self.pod_by_hostname.get(hostname))
    }

    pub fn running_pods(&self) -> impl Iterator<Item = &Arc<Pod>> {
        self.running_pods_by_key
            .values()
            .filter_map(|i| self.pods.get(*i))
    }

    /// Look up a container by its full or short id
    pub fn get_container_by_cid(&self, cid: &str) -> Option<&Arc<Container>> {
        if cid.len() > SHORT_ID_LEN {
            if let Some(c) = self.container_by_id.get(cid) {
                return Some(c);
            }
        }
        self.container_by_short_id
            .get(short_id(cid))
            .filter(|c| c.id.starts_with(cid))
    }

    /// Owning pod of a container, resolved through this snapshot
    pub fn pod_of(&self, container: &Container) -> Option<&Arc<Pod>> {
        self.get_pod_by_uid(&container.pod_uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ContainerBuilder, PodBuilder};

    fn sample() -> PodGraph {
        let sandbox = ContainerBuilder::new("sandbox00000000000001").sandbox().pod("app", "web-1", "U1");
        let biz = ContainerBuilder::new("abcdef0123456789aaaa").pod("app", "web-1", "U1");
        let pod = PodBuilder::new("app", "web-1", "U1")
            .ip("10.0.0.5")
            .running()
            .sandbox(sandbox.build())
            .biz(biz.build())
            .build();
        let pending = PodBuilder::new("app", "web-2", "U2").phase("Pending").build();
        PodGraph::build(vec![Arc::new(pod), Arc::new(pending)])
    }

    #[test]
    fn test_short_and_full_cid_match() {
        let graph = sample();
        let full = graph.get_container_by_cid("abcdef0123456789aaaa").unwrap();
        let short = graph.get_container_by_cid("abcdef012345").unwrap();

        assert!(Arc::ptr_eq(full, short));
        assert!(graph.get_container_by_cid("abcdef0").is_none());
        assert!(graph.get_container_by_cid("abcdef0123456789bbbb").is_none());
        assert!(graph.get_container_by_cid("zzz").is_none());
    }

    #[test]
    fn test_indices_agree() {
        let graph = sample();
        for pod in graph.pods() {
            assert!(Arc::ptr_eq(graph.get_pod_by_key(&pod.key()).unwrap(), pod));
            assert!(Arc::ptr_eq(graph.get_pod_by_uid(&pod.uid).unwrap(), pod));
            for c in &pod.all {
                assert!(Arc::ptr_eq(graph.pod_of(c).unwrap(), pod));
            }
        }

        assert_eq!(graph.get_pod_by_ip("10.0.0.5").unwrap().name, "web-1");
        assert_eq!(
            graph.get_pod_by_sandbox_id("sandbox00000000000001").unwrap().name,
            "web-1"
        );
        assert_eq!(graph.running_pods().count(), 1);
        assert_eq!(graph.container_count(), 2);
    }

    #[test]
    fn test_container_subsets_within_all() {
        let graph = sample();
        for pod in graph.pods() {
            let mut seen = std::collections::HashSet::new();
            let subsets = pod
                .biz
                .iter()
                .chain(pod.sidecar.iter())
                .chain(pod.sandbox.iter());
            for c in subsets {
                assert!(pod.all.iter().any(|a| Arc::ptr_eq(a, c)));
                assert!(seen.insert(c.id.clone()), "duplicate {}", c.id);
            }
        }
    }
}
