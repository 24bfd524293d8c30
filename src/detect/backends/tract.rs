use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use super::labels::coco_label;
use crate::detect::backend::DetectorBackend;
use crate::detect::result::{non_max_suppression, BoundingBox, Detection};

const BOX_FIELDS: usize = 4;
const PAD_VALUE: f32 = 114.0 / 255.0;

/// YOLOv8 ONNX backend running on tract.
///
/// The model is loaded and optimised once; the resulting plan is immutable, so one
/// instance serves every camera concurrently.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    input_size: u32,
    iou_threshold: f32,
}

impl TractBackend {
    /// Load a square-input YOLOv8 model (`[1, 3, size, size]` in, `[1, 4 + nc, anchors]` out).
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let size = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(0, f32::fact([1, 3, size, size]).into())
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            iou_threshold: 0.45,
        })
    }

    pub fn with_iou(mut self, iou_threshold: f32) -> Self {
        self.iou_threshold = iou_threshold;
        self
    }

    /// Letterbox into the top-left of a padded square. Returns the tensor and scale.
    fn build_input(&self, frame: &RgbImage) -> Result<(Tensor, f32)> {
        let (w0, h0) = frame.dimensions();
        if w0 == 0 || h0 == 0 {
            return Err(anyhow!("empty frame"));
        }
        let size = self.input_size as f32;
        let ratio = (size / w0 as f32).min(size / h0 as f32);
        let new_w = ((w0 as f32 * ratio).round() as u32).clamp(1, self.input_size);
        let new_h = ((h0 as f32 * ratio).round() as u32).clamp(1, self.input_size);
        let resized = image::imageops::resize(frame, new_w, new_h, FilterType::Triangle);

        let side = self.input_size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            if (x as u32) < new_w && (y as u32) < new_h {
                resized.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0
            } else {
                PAD_VALUE
            }
        });
        Ok((input.into_tensor(), ratio))
    }

    fn decode(
        &self,
        output: &Tensor,
        ratio: f32,
        frame: &RgbImage,
        threshold: f32,
    ) -> Result<Vec<Detection>> {
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 {
            return Err(anyhow!("unexpected YOLO output shape {:?}", shape));
        }
        // [1, 4 + nc, anchors], or transposed exports [1, anchors, 4 + nc].
        let transposed = shape[1] > shape[2];
        let (fields, anchors) = if transposed {
            (shape[2], shape[1])
        } else {
            (shape[1], shape[2])
        };
        if fields <= BOX_FIELDS {
            return Err(anyhow!("YOLO output has no class scores: {:?}", shape));
        }
        let at = |field: usize, anchor: usize| -> f32 {
            if transposed {
                view[[0, anchor, field]]
            } else {
                view[[0, field, anchor]]
            }
        };

        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let (class_id, score) = (BOX_FIELDS..fields)
                .map(|field| (field - BOX_FIELDS, at(field, anchor)))
                .fold((0usize, f32::NEG_INFINITY), |best, cur| {
                    if cur.1 > best.1 {
                        cur
                    } else {
                        best
                    }
                });
            if !(score >= threshold) {
                continue;
            }
            let bbox = BoundingBox::from_center(
                at(0, anchor) / ratio,
                at(1, anchor) / ratio,
                at(2, anchor) / ratio,
                at(3, anchor) / ratio,
            )
            .and_then(|bbox| bbox.clamp_to(frame.width(), frame.height()));
            if let Some(bbox) = bbox {
                candidates.push(Detection::new(coco_label(class_id), score, bbox));
            }
        }
        Ok(non_max_suppression(candidates, self.iou_threshold))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&self, frame: &RgbImage, confidence_threshold: f32) -> Result<Vec<Detection>> {
        let (input, ratio) = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        self.decode(output, ratio, frame, confidence_threshold)
    }

    fn warm_up(&self) -> Result<()> {
        let blank = RgbImage::new(self.input_size, self.input_size);
        self.detect(&blank, 1.0).map(|_| ())
    }
}
