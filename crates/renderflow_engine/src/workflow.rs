//! Workflow builder.
//!
//! Produces the opaque node-graph descriptor the rendering backend executes.
//! The graph layout mirrors the backend's prompt format: checkpoint loader,
//! optional LoRA chain, text encoders, latent, sampler, decode, save.

use serde_json::{json, Map, Value};

use renderflow_protocol::GenerationRequest;

#[derive(Debug, Clone, Default)]
pub struct WorkflowBuilder;

impl WorkflowBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build the workflow graph for a resolved generation request.
    pub fn build(&self, request: &GenerationRequest) -> Value {
        let mut nodes = Map::new();

        nodes.insert(
            "1".to_string(),
            json!({
                "class_type": "CheckpointLoaderSimple",
                "inputs": { "ckpt_name": request.checkpoint_model }
            }),
        );

        // LoRA chain: each link rewires model/clip to the previous node.
        let mut model_source = json!(["1", 0]);
        let mut clip_source = json!(["1", 1]);
        for (index, lora) in request.lora_models.iter().enumerate() {
            let node_id = format!("lora_{index}");
            nodes.insert(
                node_id.clone(),
                json!({
                    "class_type": "LoraLoader",
                    "inputs": {
                        "lora_name": lora.name,
                        "strength_model": lora.strength_model,
                        "strength_clip": lora.strength_clip,
                        "model": model_source,
                        "clip": clip_source,
                    }
                }),
            );
            model_source = json!([node_id, 0]);
            clip_source = json!([node_id, 1]);
        }

        nodes.insert(
            "2".to_string(),
            json!({
                "class_type": "CLIPTextEncode",
                "inputs": { "text": request.prompt, "clip": clip_source }
            }),
        );
        nodes.insert(
            "3".to_string(),
            json!({
                "class_type": "CLIPTextEncode",
                "inputs": { "text": request.negative_prompt, "clip": clip_source }
            }),
        );
        nodes.insert(
            "4".to_string(),
            json!({
                "class_type": "EmptyLatentImage",
                "inputs": {
                    "width": request.width,
                    "height": request.height,
                    "batch_size": request.batch_size,
                }
            }),
        );
        nodes.insert(
            "5".to_string(),
            json!({
                "class_type": "KSampler",
                "inputs": {
                    "seed": request.sampler_params.seed,
                    "steps": request.sampler_params.steps,
                    "cfg": request.sampler_params.cfg,
                    "sampler_name": request.sampler_params.sampler_name,
                    "scheduler": request.sampler_params.scheduler,
                    "denoise": request.sampler_params.denoise,
                    "model": model_source,
                    "positive": ["2", 0],
                    "negative": ["3", 0],
                    "latent_image": ["4", 0],
                }
            }),
        );
        nodes.insert(
            "6".to_string(),
            json!({
                "class_type": "VAEDecode",
                "inputs": { "samples": ["5", 0], "vae": ["1", 2] }
            }),
        );
        nodes.insert(
            "7".to_string(),
            json!({
                "class_type": "SaveImage",
                "inputs": {
                    "images": ["6", 0],
                    "filename_prefix": request.filename_prefix,
                }
            }),
        );

        Value::Object(nodes)
    }
}
