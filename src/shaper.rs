// Request shaping.
//
// Takes the caller's raw generation request and turns it into what the engine expects:
// the style token goes on the prompt, the negative tokens on the negative prompt, the
// checkpoint and clip-skip are pinned in override_settings, and a face-swap source image
// becomes the face-swap plugin's argument list.

use log::debug;
use serde_json::{Map, Number, Value};

use crate::{
    config::{FaceSwapConfig, ModifierConfig},
    error::WorkerError,
};

// Worker-only request fields. None of these are passed through to the engine.
pub const LORA_LEVEL: &str = "lora_level";
pub const CLIP_SKIP: &str = "clip_skip";
pub const FACE_SWAP_IMAGE: &str = "face_swap_image";
pub const FACE_SWAP_STRENGTH: &str = "face_swap_strength";

const OVERRIDE_SETTINGS: &str = "override_settings";
const ALWAYSON_SCRIPTS: &str = "alwayson_scripts";

/// Number of positional arguments the face-swap plugin takes.
pub const FACE_SWAP_ARG_COUNT: usize = 31;

fn malformed(message: impl Into<String>) -> WorkerError {
    WorkerError::MalformedRequest(message.into())
}

/// Face-swap plugin settings, by name.
/// Only `to_positional` knows the order the plugin wants them in.
#[derive(Clone, Debug, PartialEq)]
pub struct FaceSwapArgs {
    pub source_image: String,
    pub enabled: bool,
    pub source_faces: String,
    pub target_faces: String,
    pub model: String,
    pub restorer: String,
    pub restore_visibility: f64,
    pub restore_before_upscale: bool,
    pub upscaler: String,
    pub upscaler_scale: f64,
    pub upscaler_visibility: f64,
    pub swap_in_source: bool,
    pub swap_in_generated: bool,
    pub log_level: u8,
    pub gender_source: u8,
    pub gender_target: u8,
    pub save_original: bool,
    pub codeformer_weight: f64,
    pub source_hash_check: bool,
    pub target_hash_check: bool,
    pub device: String,
    pub mask_correction: bool,
    pub source_type: u8,
    pub face_model: Option<String>,
    pub source_folder: Option<String>,
    pub random_image: bool,
    pub force_upscale: bool,
    pub detection_threshold: f64,
    pub max_faces: u32,
    pub blend_faces: bool,
}

impl FaceSwapArgs {
    pub fn new(config: &FaceSwapConfig, source_image: String, strength: f64) -> Self {
        Self {
            source_image,
            enabled: true,
            source_faces: "0".to_string(),
            target_faces: "0".to_string(),
            model: config.model.clone(),
            restorer: config.restorer.clone(),
            restore_visibility: strength,
            restore_before_upscale: true,
            upscaler: config.upscaler.clone(),
            upscaler_scale: config.upscaler_scale,
            upscaler_visibility: 1.0,
            swap_in_source: false,
            swap_in_generated: true,
            log_level: 1,
            gender_source: 0,
            gender_target: 0,
            save_original: false,
            codeformer_weight: config.codeformer_weight,
            source_hash_check: true,
            target_hash_check: false,
            device: config.device.clone(),
            mask_correction: false,
            source_type: 0,
            face_model: None,
            source_folder: None,
            random_image: false,
            force_upscale: false,
            detection_threshold: config.detection_threshold,
            max_faces: config.max_faces,
            blend_faces: true,
        }
    }

    /// The plugin's positional argument list.
    pub fn to_positional(&self) -> Vec<Value> {
        let float = |f: f64| Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null);
        let opt = |s: &Option<String>| s.clone().map(Value::String).unwrap_or(Value::Null);
        let args = vec![
            Value::String(self.source_image.clone()),
            Value::Bool(self.enabled),
            Value::String(self.source_faces.clone()),
            Value::String(self.target_faces.clone()),
            Value::String(self.model.clone()),
            Value::String(self.restorer.clone()),
            float(self.restore_visibility),
            Value::Bool(self.restore_before_upscale),
            Value::String(self.upscaler.clone()),
            float(self.upscaler_scale),
            float(self.upscaler_visibility),
            Value::Bool(self.swap_in_source),
            Value::Bool(self.swap_in_generated),
            Value::from(self.log_level),
            Value::from(self.gender_source),
            Value::from(self.gender_target),
            Value::Bool(self.save_original),
            float(self.codeformer_weight),
            Value::Bool(self.source_hash_check),
            Value::Bool(self.target_hash_check),
            Value::String(self.device.clone()),
            Value::Bool(self.mask_correction),
            Value::from(self.source_type),
            opt(&self.face_model),
            opt(&self.source_folder),
            // Slot the plugin reserves for its UI; always null over the API.
            Value::Null,
            Value::Bool(self.random_image),
            Value::Bool(self.force_upscale),
            float(self.detection_threshold),
            Value::from(self.max_faces),
            Value::Bool(self.blend_faces),
        ];
        debug_assert_eq!(args.len(), FACE_SWAP_ARG_COUNT);
        args
    }
}

/// A request ready for the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct ShapedRequest {
    body: Map<String, Value>,
    face_swap: Option<FaceSwapArgs>,
    plugin_name: String,
}

impl ShapedRequest {
    pub fn face_swap(&self) -> Option<&FaceSwapArgs> {
        self.face_swap.as_ref()
    }

    /// Whether the face-swap plugin will run, either because we set it up or because
    /// the caller passed its script arguments directly.
    pub fn is_face_swap(&self) -> bool {
        self.face_swap.is_some()
            || self
                .body
                .get(ALWAYSON_SCRIPTS)
                .and_then(Value::as_object)
                .map(|scripts| scripts.contains_key(&self.plugin_name))
                .unwrap_or(false)
    }

    /// Engine endpoint for this request, relative to the API root.
    pub fn route(&self) -> &'static str {
        if self.body.contains_key("init_images") {
            "img2img"
        } else {
            "txt2img"
        }
    }

    /// The JSON body sent to the engine.
    pub fn to_body(&self) -> Value {
        let mut body = self.body.clone();
        if let Some(args) = &self.face_swap {
            let scripts = body
                .entry(ALWAYSON_SCRIPTS)
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(scripts) = scripts {
                let mut plugin = Map::new();
                plugin.insert("args".to_string(), Value::Array(args.to_positional()));
                scripts.insert(self.plugin_name.clone(), Value::Object(plugin));
            }
        }
        Value::Object(body)
    }
}

#[derive(Clone, Debug)]
pub struct RequestShaper {
    modifiers: ModifierConfig,
    face_swap: FaceSwapConfig,
}

impl RequestShaper {
    pub fn new(modifiers: ModifierConfig, face_swap: FaceSwapConfig) -> Self {
        Self { modifiers, face_swap }
    }

    pub fn shape(&self, input: &Value) -> Result<ShapedRequest, WorkerError> {
        let mut body = input
            .as_object()
            .cloned()
            .ok_or_else(|| malformed("input must be a JSON object"))?;

        // Positive prompt: append the style token.
        let level = match take_number(&mut body, LORA_LEVEL)? {
            Some(level) => level,
            None => Number::from_f64(self.modifiers.default_lora_level)
                .ok_or_else(|| malformed("default lora level is not a finite number"))?,
        };
        let token = format!("<lora:{}:{}>", self.modifiers.lora_name, level);
        let prompt = match take_string(&mut body, "prompt")? {
            Some(prompt) if !prompt.is_empty() => format!("{}, {}", prompt, token),
            _ => token,
        };
        body.insert("prompt".to_string(), Value::String(prompt));

        // Negative prompt: append the negative tokens, keeping whatever the caller wrote first.
        let negative = take_string(&mut body, "negative_prompt")?.unwrap_or_default();
        let negative = match (negative.is_empty(), self.modifiers.negative_tokens.is_empty()) {
            (true, _) => self.modifiers.negative_tokens.clone(),
            (false, true) => negative,
            (false, false) => format!("{}, {}", negative, self.modifiers.negative_tokens),
        };
        body.insert("negative_prompt".to_string(), Value::String(negative));

        // Override settings: pin clip skip and the checkpoint, keep the rest.
        let clip_skip = match body.remove(CLIP_SKIP) {
            None | Some(Value::Null) => self.modifiers.default_clip_skip,
            Some(value) => value
                .as_u64()
                .filter(|v| *v >= 1)
                .ok_or_else(|| malformed("clip_skip must be a positive integer"))?,
        };
        let mut overrides = match body.remove(OVERRIDE_SETTINGS) {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(overrides)) => overrides,
            Some(_) => return Err(malformed("override_settings must be an object")),
        };
        overrides.insert("CLIP_stop_at_last_layers".to_string(), Value::from(clip_skip));
        if let Some(checkpoint) = &self.modifiers.checkpoint {
            overrides.insert("sd_model_checkpoint".to_string(), Value::String(checkpoint.clone()));
        }
        body.insert(OVERRIDE_SETTINGS.to_string(), Value::Object(overrides));

        match body.get(ALWAYSON_SCRIPTS) {
            None | Some(Value::Object(_)) => {}
            Some(_) => return Err(malformed("alwayson_scripts must be an object")),
        }
        match body.get("init_images") {
            None => {}
            Some(Value::Array(images)) if images.iter().all(Value::is_string) => {}
            Some(_) => return Err(malformed("init_images must be a list of base64 strings")),
        }

        // Face swap: the source image and strength move into the plugin arguments.
        let strength = take_number(&mut body, FACE_SWAP_STRENGTH)?
            .and_then(|n| n.as_f64())
            .unwrap_or(self.face_swap.default_strength);
        let face_swap = take_string(&mut body, FACE_SWAP_IMAGE)?
            .filter(|image| !image.is_empty())
            .map(|image| FaceSwapArgs::new(&self.face_swap, image, strength));
        if face_swap.is_some() {
            debug!("Face swap enabled via {}", self.face_swap.plugin_name);
        }

        Ok(ShapedRequest {
            body,
            face_swap,
            plugin_name: self.face_swap.plugin_name.clone(),
        })
    }
}

fn take_string(body: &mut Map<String, Value>, key: &str) -> Result<Option<String>, WorkerError> {
    match body.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(malformed(format!("{} must be a string", key))),
    }
}

fn take_number(body: &mut Map<String, Value>, key: &str) -> Result<Option<Number>, WorkerError> {
    match body.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(Some(n)),
        Some(_) => Err(malformed(format!("{} must be a number", key))),
    }
}
