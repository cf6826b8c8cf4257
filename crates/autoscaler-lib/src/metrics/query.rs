//! Query templates with identity placeholders

use serde::Deserialize;

const PVC_PLACEHOLDER: &str = "{{pvc_name}}";
const NAMESPACE_PLACEHOLDER: &str = "{{namespace}}";
const POD_PLACEHOLDER: &str = "{{pod_name}}";

/// PromQL templates for the three usage queries
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueryTemplates {
    pub disk_usage: String,
    pub ingress: String,
    pub egress: String,
}

impl QueryTemplates {
    pub fn disk_usage_query(&self, claim_name: &str, namespace: &str) -> String {
        render(&self.disk_usage, claim_name, namespace, "")
    }

    pub fn ingress_query(&self, pod_name: &str, namespace: &str) -> String {
        render(&self.ingress, "", namespace, pod_name)
    }

    pub fn egress_query(&self, pod_name: &str, namespace: &str) -> String {
        render(&self.egress, "", namespace, pod_name)
    }
}

/// Replace every occurrence of each placeholder
fn render(template: &str, claim_name: &str, namespace: &str, pod_name: &str) -> String {
    template
        .replace(PVC_PLACEHOLDER, claim_name)
        .replace(NAMESPACE_PLACEHOLDER, namespace)
        .replace(POD_PLACEHOLDER, pod_name)
}
