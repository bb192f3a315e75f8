use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

/// Accessor trait over the workload kinds whose pod templates get their images
/// rewritten. Deployments and DaemonSets expose the same relevant shape, so one
/// reconciler serves both.
pub trait Workload
where
    Self: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Send
        + Sync
        + Serialize
        + DeserializeOwned
        + 'static,
{
    fn kind_name() -> &'static str {
        std::any::type_name::<Self>().split("::").last().unwrap()
    }

    fn pod_template(&self) -> Option<&PodTemplateSpec>;
    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec>;

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.pod_template().and_then(|template| template.spec.as_ref())
    }

    fn containers(&self) -> &[Container] {
        self.pod_spec()
            .map(|spec| spec.containers.as_slice())
            .unwrap_or(&[])
    }
}

impl Workload for Deployment {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut().and_then(|s| s.template.spec.as_mut())
    }
}

impl Workload for DaemonSet {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut().and_then(|s| s.template.spec.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;

    #[test]
    fn test_kind_name() {
        assert_eq!(Deployment::kind_name(), "Deployment");
        assert_eq!(DaemonSet::kind_name(), "DaemonSet");
    }

    #[test]
    fn test_containers_empty_without_spec() {
        let deployment = Deployment::default();
        assert!(deployment.containers().is_empty());
        assert!(deployment.pod_template().is_none());
    }

    #[test]
    fn test_containers_through_template() {
        let deployment = Deployment {
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "web".to_string(),
                            image: Some("nginx:1.25".to_string()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_eq!(deployment.containers().len(), 1);
        assert_eq!(
            deployment.containers()[0].image.as_deref(),
            Some("nginx:1.25")
        );
    }
}
