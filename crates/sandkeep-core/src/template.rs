use serde::{Deserialize, Serialize};

use crate::ids::TemplateId;
use crate::request::{ResourceSpec, Retention};

/// A named recipe from which sandboxes are instantiated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub id: TemplateId,
    pub base_image_ref: String,
    pub kernel_image_ref: String,
    pub default_resources: ResourceSpec,
    #[serde(default)]
    pub warmup_command: Option<String>,
    #[serde(default)]
    pub default_retention: Retention,
}
