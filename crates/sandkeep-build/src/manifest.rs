use serde::{Deserialize, Serialize};

/// OCI-shaped image manifest: an ordered list of layers applied
/// bottom-to-top into the rootfs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub layers: Vec<LayerDescriptor>,
}

/// One content-addressed layer. `digest` is the hex-encoded SHA-256
/// used as the blob store key suffix (`layers/<digest>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerDescriptor {
    pub digest: String,
    pub media_type: String,
    pub size: u64,
}

impl Manifest {
    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        serde_json::from_str(content).map_err(|e| anyhow::anyhow!("invalid image manifest: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_layers_in_order() {
        let json = r#"{
            "schema_version": 2,
            "layers": [
                {"digest": "aaa", "media_type": "application/vnd.oci.image.layer.v1.tar", "size": 10},
                {"digest": "bbb", "media_type": "application/vnd.oci.image.layer.v1.tar", "size": 20}
            ]
        }"#;
        let manifest = Manifest::from_json(json).unwrap();
        assert_eq!(manifest.layers.len(), 2);
        assert_eq!(manifest.layers[0].digest, "aaa");
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(Manifest::from_json("not json").is_err());
    }
}
