//! Label selector rendering for pod listing

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

/// Render a structured selector in the string form accepted by list calls,
/// e.g. `app=web,tier in (api,edge),!canary`
pub fn format_label_selector(selector: &LabelSelector) -> String {
    let mut parts = Vec::new();

    if let Some(labels) = &selector.match_labels {
        for (key, value) in labels {
            parts.push(format!("{key}={value}"));
        }
    }

    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let values = expr.values.clone().unwrap_or_default().join(",");
            let rendered = match expr.operator.as_str() {
                "In" => format!("{} in ({})", expr.key, values),
                "NotIn" => format!("{} notin ({})", expr.key, values),
                "Exists" => expr.key.clone(),
                "DoesNotExist" => format!("!{}", expr.key),
                _ => continue,
            };
            parts.push(rendered);
        }
    }

    parts.join(",")
}
