pub mod error;
pub mod model;
pub mod registry;
pub mod utils;

pub use error::{Error, Result};

use crate::{
    model::generator::{UnetGenerator, UnetGeneratorConfig},
    utils::{pixels_to_tensor, tensor_to_pixels},
};
use burn::{
    backend::NdArray,
    tensor::{Device, Tensor},
};
use wasm_bindgen::prelude::*;

pub type InferenceBackend = NdArray<f32>;

/// Browser entry point: runs a default-configured generator over an RGB
/// buffer laid out as `[3, height, width]` with values in `0..=255`.
#[wasm_bindgen]
pub struct Translator {
    generator: UnetGenerator<InferenceBackend>,
    device: Device<InferenceBackend>,
}

#[wasm_bindgen]
impl Translator {
    #[wasm_bindgen(constructor)]
    pub fn new() -> Self {
        let device = Default::default();
        let generator = UnetGeneratorConfig::new().init(&device);

        Self { generator, device }
    }

    #[wasm_bindgen]
    pub fn translate(
        &self,
        image: Vec<f32>,
        width: usize,
        height: usize,
    ) -> std::result::Result<Vec<f32>, JsValue> {
        self.translate_pixels(image, width, height)
            .map_err(|err| JsValue::from_str(&err.to_string()))
    }
}

impl Translator {
    fn translate_pixels(&self, image: Vec<f32>, width: usize, height: usize) -> Result<Vec<f32>> {
        let image = pixels_to_tensor(image, width, height, &self.device)?;
        let translated: Tensor<InferenceBackend, 3> =
            self.generator.try_forward(image)?.squeeze(0);

        tensor_to_pixels(translated)
    }
}

impl Default for Translator {
    fn default() -> Self {
        Self::new()
    }
}
