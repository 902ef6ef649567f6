//! Decoder network description for neural-compressed materials.

use crate::asset::{AssetError, read_file};
use crate::device::GraphicsDevice;
use crate::gpu::DeviceError;
use crate::structured_buffer::StructuredBuffer;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::rc::Rc;

#[derive(Debug, Deserialize)]
struct LayerRecord {
    name: String,
    #[serde(default)]
    in_channels: u32,
    #[serde(default)]
    out_channels: u32,
    #[serde(default)]
    weight: Value,
    #[serde(default)]
    bias: Value,
}

/// Fully-connected layers of the decoder, stored as `1x1` convolutions.
pub struct NeuralModel {
    layer_sizes: Vec<u32>,
    weights: Vec<f32>,
    biases: Vec<f32>,
    buffers: Option<(Rc<StructuredBuffer>, Rc<StructuredBuffer>)>,
}

impl NeuralModel {
    pub fn load(path: &Path) -> Result<Self, AssetError> {
        let bytes = read_file(path)?;
        let root: Value =
            serde_json::from_slice(&bytes).map_err(|e| AssetError::malformed(path, format!("invalid JSON: {e}")))?;
        Self::from_json(path, &root)
    }

    fn from_json(path: &Path, root: &Value) -> Result<Self, AssetError> {
        let num_layers = root
            .get("num_layers")
            .and_then(Value::as_u64)
            .ok_or_else(|| AssetError::malformed(path, "missing num_layers"))?;

        let mut layer_sizes = Vec::new();
        let mut weights = Vec::new();
        let mut biases = Vec::new();
        let mut last_out = None;

        for index in 0..num_layers {
            let key = format!("layer{index}");
            let record = root
                .get(&key)
                .ok_or_else(|| AssetError::malformed(path, format!("missing {key}")))?;
            let layer: LayerRecord = serde_json::from_value(record.clone())
                .map_err(|e| AssetError::malformed(path, format!("{key}: {e}")))?;
            if layer.name != "Conv2d" {
                log::debug!("{}: skipping {key} ({})", path.display(), layer.name);
                continue;
            }
            if let Some(prev) = last_out.filter(|prev| *prev != layer.in_channels) {
                return Err(AssetError::malformed(
                    path,
                    format!("{key} takes {} inputs but the previous layer produces {prev}", layer.in_channels),
                ));
            }

            let start = weights.len();
            flatten(&layer.weight, &mut weights).map_err(|e| AssetError::malformed(path, format!("{key}.weight: {e}")))?;
            let expected = layer.in_channels as usize * layer.out_channels as usize;
            if weights.len() - start != expected {
                return Err(AssetError::malformed(
                    path,
                    format!("{key} has {} weights, expected {expected}", weights.len() - start),
                ));
            }

            let start = biases.len();
            flatten(&layer.bias, &mut biases).map_err(|e| AssetError::malformed(path, format!("{key}.bias: {e}")))?;
            if biases.len() - start != layer.out_channels as usize {
                return Err(AssetError::malformed(
                    path,
                    format!("{key} has {} biases, expected {}", biases.len() - start, layer.out_channels),
                ));
            }

            layer_sizes.push(layer.in_channels);
            last_out = Some(layer.out_channels);
        }

        let Some(out) = last_out else {
            return Err(AssetError::malformed(path, "no Conv2d layers"));
        };
        layer_sizes.push(out);

        Ok(Self {
            layer_sizes,
            weights,
            biases,
            buffers: None,
        })
    }

    /// Input width of every layer followed by the output width of the last.
    pub fn layer_sizes(&self) -> &[u32] {
        &self.layer_sizes
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn biases(&self) -> &[f32] {
        &self.biases
    }

    /// Weight and bias buffers, created and uploaded on first use. Must be
    /// called while the device is recording.
    pub fn gpu_buffers(
        &mut self,
        device: &mut GraphicsDevice,
    ) -> Result<(Rc<StructuredBuffer>, Rc<StructuredBuffer>), DeviceError> {
        if let Some((weights, biases)) = &self.buffers {
            return Ok((Rc::clone(weights), Rc::clone(biases)));
        }
        let weights = StructuredBuffer::from_slice(device, "NeuralWeights", &self.weights)?;
        let biases = StructuredBuffer::from_slice(device, "NeuralBiases", &self.biases)?;
        // The draw that needs them is being recorded now.
        weights.upload(device)?;
        biases.upload(device)?;
        self.buffers = Some((Rc::clone(&weights), Rc::clone(&biases)));
        Ok((weights, biases))
    }

    /// Retires the weight and bias buffers; the next draw recreates them.
    pub fn release_gpu_buffers(&mut self, device: &mut GraphicsDevice) {
        if let Some((weights, biases)) = self.buffers.take() {
            device.release_buffer(&weights);
            device.release_buffer(&biases);
        }
    }
}

fn flatten(value: &Value, out: &mut Vec<f32>) -> Result<(), String> {
    match value {
        Value::Number(n) => {
            let v = n.as_f64().ok_or_else(|| format!("{n} is not representable"))?;
            out.push(v as f32);
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(|item| flatten(item, out)),
        Value::Null => Err("missing".to_owned()),
        other => Err(format!("unexpected {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn model(root: Value) -> Result<NeuralModel, AssetError> {
        NeuralModel::from_json(Path::new("model.json"), &root)
    }

    #[test]
    fn reads_conv_layers_in_order() {
        let root = json!({
            "num_layers": 3,
            "layer0": { "name": "Conv2d", "in_channels": 2, "out_channels": 3,
                        "weight": [[[[1.0]], [[2.0]]], [[[3.0]], [[4.0]]], [[[5.0]], [[6.0]]]],
                        "bias": [0.1, 0.2, 0.3] },
            "layer1": { "name": "ReLU" },
            "layer2": { "name": "Conv2d", "in_channels": 3, "out_channels": 1,
                        "weight": [7.0, 8.0, 9.0], "bias": [0.5] }
        });
        let model = model(root).unwrap();
        assert_eq!(model.layer_sizes(), &[2, 3, 1]);
        assert_eq!(model.weights(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        assert_eq!(model.biases(), &[0.1, 0.2, 0.3, 0.5]);
    }

    #[test]
    fn rejects_layers_that_do_not_chain() {
        let root = json!({
            "num_layers": 2,
            "layer0": { "name": "Conv2d", "in_channels": 1, "out_channels": 2, "weight": [1, 2], "bias": [0, 0] },
            "layer1": { "name": "Conv2d", "in_channels": 3, "out_channels": 1, "weight": [1, 2, 3], "bias": [0] }
        });
        assert!(matches!(model(root), Err(AssetError::Malformed { .. })));
    }

    #[test]
    fn rejects_wrong_weight_count() {
        let root = json!({
            "num_layers": 1,
            "layer0": { "name": "Conv2d", "in_channels": 2, "out_channels": 2, "weight": [1, 2, 3], "bias": [0, 0] }
        });
        assert!(matches!(model(root), Err(AssetError::Malformed { .. })));
    }

    #[test]
    fn rejects_missing_layer_entry() {
        let root = json!({ "num_layers": 2,
            "layer0": { "name": "Conv2d", "in_channels": 1, "out_channels": 1, "weight": [1], "bias": [0] } });
        assert!(matches!(model(root), Err(AssetError::Malformed { .. })));
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let result = NeuralModel::load(&dir.path().join("decodermodel.json"));
        assert!(matches!(result, Err(AssetError::NotFound(_))));
    }

    #[test]
    fn loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"num_layers": 1, "layer0": {{"name": "Conv2d", "in_channels": 1, "out_channels": 2, "weight": [0.5, -0.5], "bias": [1, 2]}}}}"#
        )
        .unwrap();
        let model = NeuralModel::load(file.path()).unwrap();
        assert_eq!(model.layer_sizes(), &[1, 2]);

        std::fs::write(file.path(), "{ not json").unwrap();
        assert!(matches!(NeuralModel::load(file.path()), Err(AssetError::Malformed { .. })));
    }
}
