//! Pod lifecycle transitions for controller-level subscribers
//!
//! Watches every pod in the cluster and turns state changes into
//! [`LifecycleEvent`]s delivered to the subscribers registered for the pod's
//! owner kind. Events only flow once the initial list has synced. Every
//! re-list after a reconnect drops pods the new list no longer contains.

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod as K8sPod;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::Client;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

const POD_TEMPLATE_HASH: &str = "pod-template-hash";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SilencePhase {
    Enter,
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEventKind {
    Terminating,
    Ready,
    Silence(SilencePhase),
}

/// Controller that owns a pod, with ReplicaSets folded into their Deployment
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Owner {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub kind: LifecycleEventKind,
    pub owner: Owner,
    pub pod: Arc<K8sPod>,
}

pub trait LifecycleSubscriber: Send + Sync {
    fn on_event(&self, event: &LifecycleEvent);
}

/// Controlling owner of `pod`
pub fn owner_of(pod: &K8sPod) -> Option<Owner> {
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let owner = pod
        .metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|o| o.controller == Some(true))?;
    if owner.kind != "ReplicaSet" {
        return Some(Owner {
            kind: owner.kind.clone(),
            namespace,
            name: owner.name.clone(),
        });
    }

    let hash = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(POD_TEMPLATE_HASH));
    let name = match hash.and_then(|h| owner.name.strip_suffix(&format!("-{h}"))) {
        Some(name) => name.to_string(),
        None => owner
            .name
            .rsplit_once('-')
            .map(|(name, _)| name.to_string())
            .unwrap_or_else(|| owner.name.clone()),
    };
    Some(Owner {
        kind: "Deployment".to_string(),
        namespace,
        name,
    })
}

/// All container statuses ready and at least one present
pub fn is_ready(pod: &K8sPod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|cs| !cs.is_empty() && cs.iter().all(|c| c.ready))
        .unwrap_or(false)
}

pub fn is_terminating(pod: &K8sPod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

#[derive(Default)]
struct State {
    pods: HashMap<String, Arc<K8sPod>>,
    /// Pods whose owner kind has subscribers
    owned: HashSet<String>,
    ready: HashSet<String>,
    terminating: HashSet<String>,
    /// Uids seen by the list in progress
    listing: Option<HashSet<String>>,
}

impl State {
    fn forget(&mut self, uid: &str) {
        self.pods.remove(uid);
        self.owned.remove(uid);
        self.ready.remove(uid);
        self.terminating.remove(uid);
    }
}

pub struct LifecycleWatcher {
    client: Option<Client>,
    subscribers: RwLock<HashMap<String, Vec<Arc<dyn LifecycleSubscriber>>>>,
    state: Mutex<State>,
    synced: AtomicBool,
}

impl LifecycleWatcher {
    pub fn new(client: Option<Client>) -> Self {
        Self {
            client,
            subscribers: RwLock::new(HashMap::new()),
            state: Mutex::new(State::default()),
            synced: AtomicBool::new(false),
        }
    }

    /// Register `subscriber` for pods owned by controllers of `kind`
    pub fn subscribe(&self, kind: &str, subscriber: Arc<dyn LifecycleSubscriber>) {
        self.subscribers
            .write()
            .entry(kind.to_string())
            .or_default()
            .push(subscriber);
    }

    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// Uids of tracked pods owned by a subscribed controller kind
    pub fn owned_uids(&self) -> HashSet<String> {
        self.state.lock().owned.clone()
    }

    fn has_subscribers(&self, kind: &str) -> bool {
        self.subscribers
            .read()
            .get(kind)
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }

    fn dispatch(&self, events: Vec<LifecycleEvent>) {
        if events.is_empty() {
            return;
        }
        let subscribers = self.subscribers.read();
        for event in &events {
            debug!(kind = ?event.kind, owner = %event.owner.name, "lifecycle event");
            if let Some(list) = subscribers.get(&event.owner.kind) {
                for subscriber in list {
                    subscriber.on_event(event);
                }
            }
        }
    }

    /// Record the new state of `pod` and return the transitions it makes
    fn observe(&self, state: &mut State, pod: Arc<K8sPod>, emit: bool) -> Vec<LifecycleEvent> {
        let uid = pod.metadata.uid.clone().unwrap_or_default();
        let owner = owner_of(&pod);
        match &owner {
            Some(owner) if self.has_subscribers(&owner.kind) => state.owned.insert(uid.clone()),
            _ => state.owned.remove(&uid),
        };

        let ready = is_ready(&pod);
        let terminating = is_terminating(&pod);
        let was_ready = if ready {
            !state.ready.insert(uid.clone())
        } else {
            state.ready.remove(&uid);
            true
        };
        let was_terminating = if terminating {
            !state.terminating.insert(uid.clone())
        } else {
            state.terminating.remove(&uid);
            true
        };
        state.pods.insert(uid, pod.clone());

        let (true, Some(owner)) = (emit, owner) else {
            return Vec::new();
        };
        let mut events = Vec::new();
        if terminating && !was_terminating {
            events.push(LifecycleEvent {
                kind: LifecycleEventKind::Terminating,
                owner: owner.clone(),
                pod: pod.clone(),
            });
        }
        if ready && !was_ready {
            events.push(LifecycleEvent {
                kind: LifecycleEventKind::Ready,
                owner,
                pod,
            });
        }
        events
    }

    /// Apply one watch event
    pub fn handle_event(&self, event: Event<K8sPod>) {
        let events = {
            let mut state = self.state.lock();
            match event {
                Event::Init => {
                    debug!("lifecycle watch init");
                    state.listing = Some(HashSet::new());
                    Vec::new()
                }
                Event::InitApply(pod) => {
                    if let (Some(listing), Some(uid)) = (state.listing.as_mut(), pod.metadata.uid.as_ref()) {
                        listing.insert(uid.clone());
                    }
                    let synced = self.has_synced();
                    self.observe(&mut state, Arc::new(pod), synced)
                }
                Event::InitDone => {
                    if let Some(listed) = state.listing.take() {
                        let gone: Vec<String> = state
                            .pods
                            .keys()
                            .filter(|uid| !listed.contains(*uid))
                            .cloned()
                            .collect();
                        if !gone.is_empty() {
                            debug!(pods = gone.len(), "dropping pods deleted while disconnected");
                        }
                        for uid in gone {
                            state.forget(&uid);
                        }
                    }
                    if !self.synced.swap(true, Ordering::SeqCst) {
                        info!(pods = state.pods.len(), owned = state.owned.len(), "lifecycle watch synced");
                    }
                    Vec::new()
                }
                Event::Apply(pod) => {
                    let synced = self.has_synced();
                    self.observe(&mut state, Arc::new(pod), synced)
                }
                Event::Delete(pod) => {
                    state.forget(pod.metadata.uid.as_deref().unwrap_or_default());
                    Vec::new()
                }
            }
        };
        self.dispatch(events);
    }

    /// Deliver a silence transition for the pod `uid` to its owner's subscribers
    pub fn route_silence(&self, uid: &str, phase: SilencePhase) -> bool {
        if !self.has_synced() {
            return false;
        }
        let pod = self.state.lock().pods.get(uid).cloned();
        let Some(pod) = pod else {
            return false;
        };
        let Some(owner) = owner_of(&pod) else {
            return false;
        };
        self.dispatch(vec![LifecycleEvent {
            kind: LifecycleEventKind::Silence(phase),
            owner,
            pod,
        }]);
        true
    }
}

impl LifecycleWatcher {
    /// Watch all pods until shutdown; without a client this returns at once
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let Some(client) = self.client.clone() else {
            return;
        };
        let api: Api<K8sPod> = Api::all(client);

        loop {
            let stream = watcher::watcher(api.clone(), watcher::Config::default());
            tokio::pin!(stream);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("Lifecycle watcher shutting down");
                        return;
                    }
                    event = stream.next() => match event {
                        Some(Ok(event)) => self.handle_event(event),
                        Some(Err(e)) => {
                            warn!(error = %e, "Lifecycle watch error, reconnecting");
                            break;
                        }
                        None => break,
                    }
                }
            }

            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{k8s_pod, with_container_status, STARTED_AT};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(LifecycleEventKind, Owner)>>,
    }

    impl LifecycleSubscriber for Recorder {
        fn on_event(&self, event: &LifecycleEvent) {
            self.events.lock().push((event.kind, event.owner.clone()));
        }
    }

    fn owned_by(mut pod: K8sPod, kind: &str, name: &str) -> K8sPod {
        pod.metadata.owner_references = Some(vec![OwnerReference {
            kind: kind.to_string(),
            name: name.to_string(),
            controller: Some(true),
            ..Default::default()
        }]);
        pod
    }

    fn deployment_pod(uid: &str) -> K8sPod {
        let mut pod = owned_by(
            k8s_pod("app", &format!("web-7d9f-{uid}"), uid, "Running"),
            "ReplicaSet",
            "web-7d9f",
        );
        pod.metadata.labels = Some([(POD_TEMPLATE_HASH.to_string(), "7d9f".to_string())].into());
        pod
    }

    fn ready(pod: K8sPod) -> K8sPod {
        with_container_status(pod, "docker://abc", STARTED_AT)
    }

    fn watcher() -> (LifecycleWatcher, Arc<Recorder>) {
        let watcher = LifecycleWatcher::new(None);
        let recorder = Arc::new(Recorder::default());
        watcher.subscribe("Deployment", recorder.clone());
        (watcher, recorder)
    }

    #[test]
    fn test_replicaset_reported_as_deployment() {
        let owner = owner_of(&deployment_pod("U1")).unwrap();
        assert_eq!(owner.kind, "Deployment");
        assert_eq!(owner.name, "web");

        let pod = owned_by(k8s_pod("app", "db-0", "U2", "Running"), "StatefulSet", "db");
        assert_eq!(owner_of(&pod).unwrap().kind, "StatefulSet");
        assert!(owner_of(&k8s_pod("app", "bare", "U3", "Running")).is_none());
    }

    #[test]
    fn test_is_ready_requires_statuses() {
        assert!(!is_ready(&k8s_pod("app", "p", "U1", "Running")));
        assert!(is_ready(&ready(k8s_pod("app", "p", "U1", "Running"))));
    }

    #[test]
    fn test_no_events_before_sync() {
        let (watcher, recorder) = watcher();
        watcher.handle_event(Event::Init);
        watcher.handle_event(Event::InitApply(ready(deployment_pod("U1"))));
        watcher.handle_event(Event::InitApply(k8s_pod("app", "bare", "U2", "Running")));

        assert!(recorder.events.lock().is_empty());
        assert_eq!(watcher.owned_uids(), HashSet::from(["U1".to_string()]));
        assert!(!watcher.route_silence("U1", SilencePhase::Enter));

        watcher.handle_event(Event::InitDone);
        watcher.handle_event(Event::Apply(ready(deployment_pod("U1"))));
        assert!(recorder.events.lock().is_empty());
    }

    #[test]
    fn test_ready_and_terminating_transitions() {
        let (watcher, recorder) = watcher();
        watcher.handle_event(Event::Init);
        watcher.handle_event(Event::InitDone);

        watcher.handle_event(Event::Apply(deployment_pod("U1")));
        watcher.handle_event(Event::Apply(ready(deployment_pod("U1"))));
        watcher.handle_event(Event::Apply(ready(deployment_pod("U1"))));

        let mut deleting = ready(deployment_pod("U1"));
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        watcher.handle_event(Event::Apply(deleting.clone()));
        watcher.handle_event(Event::Apply(deleting.clone()));
        watcher.handle_event(Event::Delete(deleting));

        let kinds: Vec<_> = recorder.events.lock().iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds,
            vec![LifecycleEventKind::Ready, LifecycleEventKind::Terminating]
        );
        assert!(watcher.owned_uids().is_empty());
    }

    #[test]
    fn test_relist_drops_pods_deleted_while_disconnected() {
        let (watcher, recorder) = watcher();
        watcher.handle_event(Event::Init);
        watcher.handle_event(Event::InitApply(deployment_pod("U1")));
        watcher.handle_event(Event::InitApply(deployment_pod("U2")));
        watcher.handle_event(Event::InitDone);
        assert_eq!(watcher.owned_uids().len(), 2);

        watcher.handle_event(Event::Init);
        watcher.handle_event(Event::InitApply(deployment_pod("U1")));
        assert_eq!(watcher.owned_uids().len(), 2);
        watcher.handle_event(Event::InitDone);

        assert_eq!(watcher.owned_uids(), HashSet::from(["U1".to_string()]));
        assert!(!watcher.route_silence("U2", SilencePhase::Enter));
        assert!(watcher.route_silence("U1", SilencePhase::Enter));
        assert_eq!(recorder.events.lock().len(), 1);
    }

    #[test]
    fn test_route_silence() {
        let (watcher, recorder) = watcher();
        watcher.handle_event(Event::InitDone);
        watcher.handle_event(Event::Apply(deployment_pod("U1")));

        assert!(watcher.route_silence("U1", SilencePhase::Enter));
        assert!(watcher.route_silence("U1", SilencePhase::Leave));
        assert!(!watcher.route_silence("missing", SilencePhase::Enter));

        let events = recorder.events.lock();
        assert_eq!(events[0].0, LifecycleEventKind::Silence(SilencePhase::Enter));
        assert_eq!(events[1].0, LifecycleEventKind::Silence(SilencePhase::Leave));
        assert_eq!(events[1].1.name, "web");
    }

    #[test]
    fn test_other_kinds_not_delivered() {
        let (watcher, recorder) = watcher();
        watcher.handle_event(Event::InitDone);
        let pod = owned_by(k8s_pod("app", "db-0", "U2", "Running"), "StatefulSet", "db");
        watcher.handle_event(Event::Apply(ready(pod)));
        assert!(recorder.events.lock().is_empty());
        assert!(watcher.owned_uids().is_empty());
    }
}
