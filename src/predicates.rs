use crate::cloner::is_mirror_reference;
use crate::workload::Workload;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::Mutex;

static KUBE_SYSTEM_NAMESPACE: &str = "kube-system";

/// Workloads in kube-system are never touched.
pub fn outside_kube_system<K: Workload>(object: &K) -> bool {
    object.namespace().as_deref() != Some(KUBE_SYSTEM_NAMESPACE)
}

/// Accepts only workloads whose first container still points at the original
/// registry. A mirrored first container marks the whole workload as processed,
/// which keeps status churn from re-queueing it.
pub fn first_image_unmirrored<K: Workload>(mirror_prefix: &str, object: &K) -> bool {
    let first_image = object
        .containers()
        .first()
        .and_then(|container| container.image.as_deref())
        .unwrap_or_default();
    !is_mirror_reference(mirror_prefix, first_image)
}

/// Structural comparison behind the unchanged-spec filter. With no earlier
/// revision to compare against the event always passes.
pub fn template_changed(old: Option<&PodTemplateSpec>, new: Option<&PodTemplateSpec>) -> bool {
    match old {
        None => true,
        Some(old) => Some(old) != new,
    }
}

/// Remembers the pod template each workload had when it was last reconciled
/// successfully, keyed by kind, namespace and name. Events carrying that same
/// template hold no new work and are dropped; anything else passes, including
/// redeliveries after a failed attempt.
#[derive(Default)]
pub struct TemplateTracker {
    seen: Mutex<HashMap<String, PodTemplateSpec>>,
}

impl TemplateTracker {
    pub fn accepts<K: Workload>(&self, object: &K) -> bool {
        let seen = self.seen.lock().expect("template tracker lock poisoned");
        template_changed(seen.get(&tracker_key(object)), object.pod_template())
    }

    pub fn record_success<K: Workload>(&self, object: &K) {
        let Some(template) = object.pod_template() else {
            return;
        };
        let mut seen = self.seen.lock().expect("template tracker lock poisoned");
        seen.insert(tracker_key(object), template.clone());
    }
}

fn tracker_key<K: Workload>(object: &K) -> String {
    format!(
        "{}/{}/{}",
        K::kind_name(),
        object.namespace().unwrap_or_default(),
        object.name_any()
    )
}
