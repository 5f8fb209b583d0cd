//! Detect head: per-level box/class branches, DFL decoding and the
//! conversion of distances to `(cx, cy, w, h)` boxes in input pixels.

use crate::ir::{Attribute, Tensor};
use crate::model::{Detect, HeadStage};

use super::{GraphBuilder, LoweringError, LoweringOptions, OUTPUT_NAME};

fn lower_branch(b: &mut GraphBuilder, stages: &[HeadStage], input: String) -> String {
    stages.iter().fold(input, |x, stage| match stage {
        HeadStage::Block(block) => b.conv_block(block, x),
        HeadStage::Conv(conv) => b.conv2d(&format!("/{}", conv.path), conv, x),
    })
}

/// Anchor points (cell centres) and their strides for feature maps of the
/// given `(height, width, stride)`. Points are laid out as `[2, A]`, x
/// coordinates first.
pub(crate) fn make_anchors(levels: &[(usize, usize, f32)]) -> (Vec<f32>, Vec<f32>) {
    let total: usize = levels.iter().map(|(h, w, _)| h * w).sum();
    let mut xs = Vec::with_capacity(total);
    let mut ys = Vec::with_capacity(total);
    let mut strides = Vec::with_capacity(total);
    for &(h, w, stride) in levels {
        for y in 0..h {
            for x in 0..w {
                xs.push(x as f32 + 0.5);
                ys.push(y as f32 + 0.5);
                strides.push(stride);
            }
        }
    }
    xs.extend(ys);
    (xs, strides)
}

/// Distribution focal loss decoding: softmax over the `reg_max` bins of each
/// side, projected onto `0..reg_max` by a fixed 1x1 convolution.
fn lower_dfl(
    b: &mut GraphBuilder,
    head: &Detect,
    input: String,
    batch: usize,
    anchors: usize,
) -> String {
    let Some(conv) = &head.dfl else {
        return input;
    };
    let scope = format!("/{}.dfl", head.path);
    let (batch, reg_max, anchors) = (batch as i64, head.reg_max as i64, anchors as i64);
    let bins = b.reshape(&scope, input, &[batch, 4, reg_max, anchors]);
    let bins = b.single(&scope, "Transpose", vec![bins], vec![("perm", Attribute::Ints(vec![0, 2, 1, 3]))]);
    let probs = b.softmax(&scope, bins, 1, 4);
    let projected = b.conv2d(&format!("/{}", conv.path), conv, probs);
    b.reshape(&scope, projected, &[batch, 4, anchors])
}

pub(super) fn lower_detect(
    b: &mut GraphBuilder,
    head: &Detect,
    inputs: Vec<String>,
    options: &LoweringOptions,
) -> Result<String, LoweringError> {
    let scope = format!("/{}", head.path);
    let layer = head
        .path
        .rsplit('.')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    if inputs.len() != head.nl() || head.stride.len() != head.nl() {
        return Err(LoweringError::InvalidLayer {
            layer,
            reason: format!(
                "Detect has {} levels but receives {} inputs",
                head.nl(),
                inputs.len()
            ),
        });
    }

    let batch = options.batch as i64;
    let mut levels = Vec::with_capacity(head.nl());
    let mut flattened = Vec::with_capacity(head.nl());
    for (i, input) in inputs.into_iter().enumerate() {
        let stride = head.stride[i].round() as usize;
        if stride == 0 || options.imgsz % stride != 0 {
            return Err(LoweringError::ImageSize {
                imgsz: options.imgsz,
                stride,
            });
        }
        let side = options.imgsz / stride;
        levels.push((side, side, head.stride[i]));

        let boxes = lower_branch(b, &head.cv2[i], input.clone());
        let classes = lower_branch(b, &head.cv3[i], input);
        let level = b.concat(&scope, vec![boxes, classes], 1);
        flattened.push(b.reshape(&scope, level, &[batch, head.no() as i64, -1]));
    }

    let (points, strides) = make_anchors(&levels);
    let anchors = strides.len();

    let x = b.concat(&scope, flattened, 2);
    let mut parts = b.split(&scope, x, &[4 * head.reg_max, head.nc], 1);
    let classes = parts.pop().unwrap_or_default();
    let distances = parts.pop().unwrap_or_default();

    let distances = lower_dfl(b, head, distances, options.batch, anchors);

    let anchor_points = b.constant(&scope, Tensor::from_f32("anchors", vec![1, 2, anchors], &points));
    let stride_values = b.constant(&scope, Tensor::from_f32("strides", vec![1, anchors], &strides));
    let two = b.constant(&scope, Tensor::from_f32("two", Vec::new(), &[2.0]));

    let mut sides = b.split(&scope, distances, &[2, 2], 1);
    let rb = sides.pop().unwrap_or_default();
    let lt = sides.pop().unwrap_or_default();
    let x1y1 = b.single(&scope, "Sub", vec![anchor_points.clone(), lt], vec![]);
    let x2y2 = b.single(&scope, "Add", vec![anchor_points, rb], vec![]);
    let sum = b.single(&scope, "Add", vec![x1y1.clone(), x2y2.clone()], vec![]);
    let centre = b.single(&scope, "Div", vec![sum, two], vec![]);
    let size = b.single(&scope, "Sub", vec![x2y2, x1y1], vec![]);
    let boxes = b.concat(&scope, vec![centre, size], 1);
    let boxes = b.single(&scope, "Mul", vec![boxes, stride_values], vec![]);

    let scores = b.single(&scope, "Sigmoid", vec![classes], vec![]);
    Ok(b.named(
        &scope,
        "Concat",
        vec![boxes, scores],
        OUTPUT_NAME,
        vec![("axis", Attribute::Int(1))],
    ))
}
