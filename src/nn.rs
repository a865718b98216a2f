//! Embedding extraction backed by ONNX models.
//!
use anyhow::{bail, Result};
use image::RgbImage;
use ndarray::Array1;
use smallvec::SmallVec;
use tract_onnx::prelude::*;

use crate::utils::ensure_model_file;

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;
type NnOut = SmallVec<[TValue; 4]>;

const MOBILENET_FILENAME: &str = "mobilenetv2-7.onnx";
const MOBILENET_URL: &str =
    "https://github.com/onnx/models/raw/main/validated/vision/classification/mobilenet/model/mobilenetv2-7.onnx";

/// Capability to turn a camera frame into one fixed-length feature vector.
///
/// The k-nearest-neighbor engine depends only on this seam, so any model
/// runtime producing a single float output tensor can drive it.
pub trait EmbedModel {
    fn embed(&self, frame: &RgbImage) -> Result<Array1<f32>>;
}

/// MobileNet v2 run as a feature extractor.
///
/// The network's single output tensor is flattened and used as the embedding.
pub struct MobileNetModel {
    model: NnModel,
    width: u32,
    height: u32,
}

impl MobileNetModel {
    /// Load the model, downloading the weights on first use.
    pub async fn new() -> Result<Self> {
        let (width, height) = (224, 224);
        let model_path = ensure_model_file(MOBILENET_FILENAME, MOBILENET_URL).await?;

        let input_fact = InferenceFact::dt_shape(
            f32::datum_type(),
            tvec!(1, 3, height as usize, width as usize),
        );
        let model = tract_onnx::onnx()
            .model_for_path(&model_path)?
            .with_input_fact(0, input_fact)?
            .into_optimized()?
            .into_runnable()?;

        let num_outputs = model.model().outputs.len();
        if num_outputs != 1 {
            bail!("embedding model must have exactly 1 output tensor, found {num_outputs}");
        }

        log::info!("Loaded embedding model from {}", model_path.display());

        Ok(Self {
            model,
            width,
            height,
        })
    }

    fn preproc(&self, frame: &RgbImage) -> Tensor {
        let resized: RgbImage = image::imageops::resize(
            frame,
            self.width,
            self.height,
            image::imageops::FilterType::Triangle,
        );

        tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, c, y, x)| {
                let mean = [0.485, 0.456, 0.406][c];
                let std = [0.229, 0.224, 0.225][c];
                (resized[(x as _, y as _)][c] as f32 / 255.0 - mean) / std
            },
        )
        .into()
    }

    fn postproc(&self, raw_nn_out: NnOut) -> Result<Array1<f32>> {
        let out = raw_nn_out[0].to_array_view::<f32>()?;
        Ok(out.iter().cloned().collect())
    }
}

impl EmbedModel for MobileNetModel {
    fn embed(&self, frame: &RgbImage) -> Result<Array1<f32>> {
        let valid_input = tvec!(self.preproc(frame).into());
        let raw_nn_out = self.model.run(valid_input)?;
        self.postproc(raw_nn_out)
    }
}
