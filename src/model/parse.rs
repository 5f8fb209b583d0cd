use tracing::debug;

use crate::ir::Tensor;
use crate::loader::Value;
use crate::model::{
    Activation, BatchNorm2d, Bottleneck, C2f, Conv2d, ConvBlock, Detect, DetectionModel, HeadStage,
    Layer, ModelError, Module, Sppf,
};
use crate::loader::CheckpointInfo;

/// Read access to a pickled `nn.Module`: `_modules`, `_parameters`,
/// `_buffers` and plain attributes, addressed by state-dict path.
#[derive(Debug, Clone)]
pub struct ModuleView<'a> {
    pub path: String,
    pub class: &'a str,
    state: &'a Value,
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}

impl<'a> ModuleView<'a> {
    pub fn new(path: impl Into<String>, value: &'a Value) -> Result<Self, ModelError> {
        let path = path.into();
        match value {
            Value::Object { name, state, .. } if matches!(state.as_ref(), Value::Dict(_)) => Ok(Self {
                path,
                class: name.as_str(),
                state: state.as_ref(),
            }),
            Value::Object { name, .. } => Err(ModelError::InvalidField {
                path,
                field: "__dict__".to_string(),
                reason: format!("{} has no attribute dict", name),
            }),
            other => Err(ModelError::InvalidField {
                path,
                field: "module".to_string(),
                reason: format!("expected a module object, found {}", describe(other)),
            }),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&'a Value> {
        self.state.get(name)
    }

    fn require(&self, name: &str) -> Result<&'a Value, ModelError> {
        self.attr(name).ok_or_else(|| self.missing(name))
    }

    fn missing(&self, field: &str) -> ModelError {
        ModelError::MissingField {
            path: self.path.clone(),
            field: field.to_string(),
        }
    }

    fn invalid(&self, field: &str, reason: impl Into<String>) -> ModelError {
        ModelError::InvalidField {
            path: self.path.clone(),
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    fn int(&self, name: &str) -> Result<i64, ModelError> {
        self.require(name)?
            .as_int()
            .ok_or_else(|| self.invalid(name, "expected an integer"))
    }

    fn usize(&self, name: &str) -> Result<usize, ModelError> {
        let value = self.int(name)?;
        usize::try_from(value).map_err(|_| self.invalid(name, format!("{} is negative", value)))
    }

    fn float(&self, name: &str) -> Result<f64, ModelError> {
        self.require(name)?
            .as_float()
            .ok_or_else(|| self.invalid(name, "expected a number"))
    }

    /// An `int` or 2-tuple attribute such as `stride` or `padding`.
    fn pair(&self, name: &str) -> Result<[usize; 2], ModelError> {
        let value = self.require(name)?;
        let to_usize = |v: &Value| v.as_int().filter(|&i| i >= 0).map(|i| i as usize);
        if let Some(single) = to_usize(value) {
            return Ok([single, single]);
        }
        match value.as_seq() {
            Some([a, b]) => match (to_usize(a), to_usize(b)) {
                (Some(a), Some(b)) => Ok([a, b]),
                _ => Err(self.invalid(name, "expected non-negative integers")),
            },
            _ => Err(self.invalid(name, format!("expected an int or pair, found {}", describe(value)))),
        }
    }

    fn modules(&self) -> Option<&'a [(Value, Value)]> {
        match self.attr("_modules") {
            Some(Value::Dict(items)) => Some(items),
            _ => None,
        }
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.modules()
            .map(|items| items.iter().any(|(k, v)| k.as_str() == Some(name) && !v.is_none()))
            .unwrap_or(false)
    }

    pub fn child(&self, name: &str) -> Result<ModuleView<'a>, ModelError> {
        let items = self.modules().ok_or_else(|| self.missing("_modules"))?;
        let value = items
            .iter()
            .find(|(k, v)| k.as_str() == Some(name) && !v.is_none())
            .map(|(_, v)| v)
            .ok_or_else(|| self.missing(name))?;
        ModuleView::new(join(&self.path, name), value)
    }

    /// Submodules in registration order.
    pub fn children(&self) -> Result<Vec<ModuleView<'a>>, ModelError> {
        let items = self.modules().ok_or_else(|| self.missing("_modules"))?;
        items
            .iter()
            .filter(|(_, v)| !v.is_none())
            .map(|(k, v)| {
                let name = match k {
                    Value::String(s) => s.clone(),
                    Value::Int(i) => i.to_string(),
                    other => return Err(self.invalid("_modules", format!("bad key {}", describe(other)))),
                };
                ModuleView::new(join(&self.path, &name), v)
            })
            .collect()
    }

    /// A parameter, buffer or tensor attribute, renamed to its state-dict key.
    pub fn tensor(&self, name: &str) -> Option<Tensor> {
        let lookup = |table: &str| match self.attr(table) {
            Some(dict @ Value::Dict(_)) => dict.get(name).and_then(Value::as_tensor),
            _ => None,
        };
        lookup("_parameters")
            .or_else(|| lookup("_buffers"))
            .or_else(|| self.attr(name).and_then(Value::as_tensor))
            .map(|t| t.clone().renamed(join(&self.path, name)))
    }

    fn require_tensor(&self, name: &str) -> Result<Tensor, ModelError> {
        self.tensor(name).ok_or_else(|| self.missing(name))
    }

    fn expect_class(&self, expected: &[&str]) -> Result<(), ModelError> {
        if expected.contains(&self.class) {
            Ok(())
        } else {
            Err(self.unsupported())
        }
    }

    fn unsupported(&self) -> ModelError {
        ModelError::UnsupportedModule {
            path: self.path.clone(),
            class: self.class.to_string(),
        }
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::None => "None".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Int(_) => "int".to_string(),
        Value::Float(_) => "float".to_string(),
        Value::String(_) => "str".to_string(),
        Value::Bytes(_) => "bytes".to_string(),
        Value::Tuple(_) => "tuple".to_string(),
        Value::List(_) => "list".to_string(),
        Value::Dict(_) => "dict".to_string(),
        Value::Set(_) => "set".to_string(),
        Value::Global { module, name } => format!("global {}.{}", module, name),
        Value::Call { callable, .. } => format!(
            "call to {}",
            callable.qualified_name().unwrap_or_else(|| "?".to_string())
        ),
        Value::Object { module, name, .. } => format!("{}.{}", module, name),
        Value::PersistentId(_) => "persistent id".to_string(),
        Value::Tensor(_) => "tensor".to_string(),
    }
}

fn parse_conv2d(view: &ModuleView) -> Result<Conv2d, ModelError> {
    view.expect_class(&["Conv2d"])?;
    let weight = view.require_tensor("weight")?;
    if weight.shape.len() != 4 {
        return Err(view.invalid("weight", format!("expected 4-D, got {:?}", weight.shape)));
    }
    if matches!(view.attr("padding"), Some(Value::String(_))) {
        return Err(view.invalid("padding", "string padding modes are not supported"));
    }
    let groups = match view.attr("groups") {
        Some(_) => view.usize("groups")?.max(1),
        None => 1,
    };
    if let Some(mode) = view.attr("padding_mode").and_then(Value::as_str) {
        if mode != "zeros" {
            return Err(view.invalid("padding_mode", format!("{} padding is not supported", mode)));
        }
    }
    Ok(Conv2d {
        path: view.path.clone(),
        bias: view.tensor("bias"),
        stride: view.pair("stride")?,
        padding: view.pair("padding")?,
        dilation: view.pair("dilation")?,
        groups,
        weight,
    })
}

fn parse_batch_norm(view: &ModuleView) -> Result<BatchNorm2d, ModelError> {
    view.expect_class(&["BatchNorm2d"])?;
    let eps = match view.attr("eps") {
        Some(_) => view.float("eps")?,
        None => 1e-5,
    };
    let momentum = view.attr("momentum").and_then(Value::as_float).unwrap_or(0.1);
    Ok(BatchNorm2d {
        path: view.path.clone(),
        weight: view.require_tensor("weight")?,
        bias: view.require_tensor("bias")?,
        running_mean: view.require_tensor("running_mean")?,
        running_var: view.require_tensor("running_var")?,
        eps,
        momentum,
    })
}

fn parse_activation(view: &ModuleView) -> Result<Activation, ModelError> {
    match view.class {
        "SiLU" => Ok(Activation::Silu),
        "ReLU" => Ok(Activation::Relu),
        "Identity" => Ok(Activation::Identity),
        _ => Err(view.unsupported()),
    }
}

fn parse_conv_block(view: &ModuleView) -> Result<ConvBlock, ModelError> {
    view.expect_class(&["Conv", "DWConv"])?;
    let conv = parse_conv2d(&view.child("conv")?)?;
    let bn = if view.has_child("bn") {
        Some(parse_batch_norm(&view.child("bn")?)?)
    } else {
        None
    };
    let act = if view.has_child("act") {
        parse_activation(&view.child("act")?)?
    } else {
        Activation::Silu
    };
    Ok(ConvBlock {
        path: view.path.clone(),
        conv,
        bn,
        act,
    })
}

fn parse_bottleneck(view: &ModuleView) -> Result<Bottleneck, ModelError> {
    view.expect_class(&["Bottleneck"])?;
    let cv1 = parse_conv_block(&view.child("cv1")?)?;
    let cv2 = parse_conv_block(&view.child("cv2")?)?;
    let add = view.attr("add").and_then(Value::as_bool).unwrap_or(false);
    Ok(Bottleneck {
        path: view.path.clone(),
        cv1,
        cv2,
        add,
    })
}

fn parse_c2f(view: &ModuleView) -> Result<C2f, ModelError> {
    view.expect_class(&["C2f"])?;
    let cv1 = parse_conv_block(&view.child("cv1")?)?;
    let cv2 = parse_conv_block(&view.child("cv2")?)?;
    let hidden = match view.attr("c") {
        Some(_) => view.usize("c")?,
        None => cv1.out_channels() / 2,
    };
    if hidden * 2 != cv1.out_channels() {
        return Err(view.invalid("c", format!("{} does not halve cv1 output {}", hidden, cv1.out_channels())));
    }
    let m = view
        .child("m")?
        .children()?
        .iter()
        .map(parse_bottleneck)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(C2f {
        path: view.path.clone(),
        hidden,
        cv1,
        cv2,
        m,
    })
}

fn parse_sppf(view: &ModuleView) -> Result<Sppf, ModelError> {
    view.expect_class(&["SPPF"])?;
    let cv1 = parse_conv_block(&view.child("cv1")?)?;
    let cv2 = parse_conv_block(&view.child("cv2")?)?;
    let pool = view.child("m")?;
    pool.expect_class(&["MaxPool2d"])?;
    let [kernel, kernel_w] = pool.pair("kernel_size")?;
    let stride = pool.pair("stride")?;
    let padding = pool.pair("padding")?;
    if kernel != kernel_w || stride != [1, 1] || padding != [kernel / 2, kernel / 2] {
        return Err(pool.invalid("kernel_size", "expected a square same-size max pool"));
    }
    Ok(Sppf {
        path: view.path.clone(),
        cv1,
        cv2,
        kernel,
    })
}

fn parse_upsample(view: &ModuleView) -> Result<usize, ModelError> {
    view.expect_class(&["Upsample"])?;
    let mode = view.attr("mode").and_then(Value::as_str).unwrap_or("nearest");
    if mode != "nearest" {
        return Err(view.invalid("mode", format!("{} interpolation is not supported", mode)));
    }
    if view.attr("size").map(|s| !s.is_none()).unwrap_or(false) {
        return Err(view.invalid("size", "fixed output sizes are not supported"));
    }
    let factor = view.require("scale_factor")?;
    let scale = factor
        .as_float()
        .or_else(|| {
            let dims = factor.as_seq()?;
            let first = dims.first()?.as_float()?;
            dims.iter().all(|d| d.as_float() == Some(first)).then_some(first)
        })
        .ok_or_else(|| view.invalid("scale_factor", "expected a uniform scale"))?;
    if scale < 1.0 || scale.fract() != 0.0 {
        return Err(view.invalid("scale_factor", format!("{} is not a positive integer", scale)));
    }
    Ok(scale as usize)
}

fn parse_head_branch(view: &ModuleView, stages: &mut Vec<HeadStage>) -> Result<(), ModelError> {
    match view.class {
        "Sequential" => {
            for child in view.children()? {
                parse_head_branch(&child, stages)?;
            }
            Ok(())
        }
        "Conv" | "DWConv" => {
            stages.push(HeadStage::Block(parse_conv_block(view)?));
            Ok(())
        }
        "Conv2d" => {
            stages.push(HeadStage::Conv(parse_conv2d(view)?));
            Ok(())
        }
        _ => Err(view.unsupported()),
    }
}

fn head_out_channels(stages: &[HeadStage]) -> Option<usize> {
    stages.last().map(|stage| match stage {
        HeadStage::Block(block) => block.out_channels(),
        HeadStage::Conv(conv) => conv.out_channels(),
    })
}

fn parse_detect(view: &ModuleView) -> Result<Detect, ModelError> {
    view.expect_class(&["Detect"])?;
    let nc = view.usize("nc")?;
    let reg_max = match view.attr("reg_max") {
        Some(_) => view.usize("reg_max")?,
        None => 16,
    };
    let stride = view
        .require_tensor("stride")?
        .to_f32_vec()
        .ok_or_else(|| view.invalid("stride", "expected a float tensor"))?;

    let branches = |name: &str| -> Result<Vec<Vec<HeadStage>>, ModelError> {
        view.child(name)?
            .children()?
            .iter()
            .map(|level| {
                let mut stages = Vec::new();
                parse_head_branch(level, &mut stages)?;
                Ok(stages)
            })
            .collect()
    };
    let cv2 = branches("cv2")?;
    let cv3 = branches("cv3")?;

    if cv2.is_empty() || cv2.len() != cv3.len() || cv2.len() != stride.len() {
        return Err(view.invalid(
            "stride",
            format!("{} strides for {} box and {} class branches", stride.len(), cv2.len(), cv3.len()),
        ));
    }
    if stride.iter().any(|&s| s < 1.0 || s.fract() != 0.0) {
        return Err(view.invalid("stride", format!("strides {:?} are not positive integers (model not built?)", stride)));
    }
    for (level, (boxes, classes)) in cv2.iter().zip(&cv3).enumerate() {
        if head_out_channels(boxes) != Some(4 * reg_max) {
            return Err(view.invalid("cv2", format!("level {} does not output {} channels", level, 4 * reg_max)));
        }
        if head_out_channels(classes) != Some(nc) {
            return Err(view.invalid("cv3", format!("level {} does not output {} classes", level, nc)));
        }
    }

    let dfl = if reg_max > 1 {
        let dfl = view.child("dfl")?;
        dfl.expect_class(&["DFL"])?;
        let conv = parse_conv2d(&dfl.child("conv")?)?;
        if conv.weight.shape != vec![1, reg_max, 1, 1] {
            return Err(dfl.invalid("conv", format!("unexpected weight shape {:?}", conv.weight.shape)));
        }
        Some(conv)
    } else {
        None
    };

    Ok(Detect {
        path: view.path.clone(),
        nc,
        reg_max,
        stride,
        cv2,
        cv3,
        dfl,
    })
}

fn parse_from(view: &ModuleView) -> Result<Vec<i64>, ModelError> {
    let value = view.require("f")?;
    if let Some(single) = value.as_int() {
        return Ok(vec![single]);
    }
    value
        .as_seq()
        .ok_or_else(|| view.invalid("f", "expected an int or list"))?
        .iter()
        .map(|v| v.as_int().ok_or_else(|| view.invalid("f", "expected integers")))
        .collect()
}

fn parse_layer(position: usize, view: &ModuleView) -> Result<Layer, ModelError> {
    let index = match view.attr("i") {
        Some(_) => view.usize("i")?,
        None => position,
    };
    if index != position {
        return Err(view.invalid("i", format!("layer {} stored at position {}", index, position)));
    }
    let from = parse_from(view)?;
    for &f in &from {
        // -1 is the previous layer, or the image for layer 0
        let valid = f == -1 || (f < 0 && position as i64 + f >= 0) || (f >= 0 && (f as usize) < position);
        if !valid {
            return Err(view.invalid("f", format!("layer {} cannot read from {}", position, f)));
        }
    }

    let module = match view.class {
        "Conv" | "DWConv" => Module::Conv(parse_conv_block(view)?),
        "C2f" => Module::C2f(parse_c2f(view)?),
        "SPPF" => Module::Sppf(parse_sppf(view)?),
        "Upsample" => Module::Upsample {
            scale: parse_upsample(view)?,
        },
        "Concat" => Module::Concat {
            dim: view.attr("d").and_then(Value::as_int).unwrap_or(1),
        },
        "Detect" => Module::Detect(parse_detect(view)?),
        _ => return Err(view.unsupported()),
    };

    Ok(Layer { index, from, module })
}

fn parse_names(root: &ModuleView, nc: usize) -> Vec<String> {
    let mut names: Vec<String> = match root.attr("names") {
        Some(Value::Dict(items)) => {
            let mut pairs: Vec<(i64, String)> = items
                .iter()
                .filter_map(|(k, v)| Some((k.as_int()?, v.as_str()?.to_string())))
                .collect();
            pairs.sort_by_key(|(k, _)| *k);
            pairs.into_iter().map(|(_, v)| v).collect()
        }
        Some(Value::List(items)) | Some(Value::Tuple(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };
    if names.len() != nc {
        names = (0..nc).map(|i| format!("class{}", i)).collect();
    }
    names
}

pub(crate) fn parse_detection_model(root: &Value) -> Result<DetectionModel, ModelError> {
    let root = ModuleView::new("", root)?;
    let sequential = root.child("model")?;
    sequential.expect_class(&["Sequential"])?;

    let layers = sequential
        .children()?
        .iter()
        .enumerate()
        .map(|(position, view)| parse_layer(position, view))
        .collect::<Result<Vec<_>, _>>()?;

    let detect_count = layers
        .iter()
        .filter(|l| matches!(l.module, Module::Detect(_)))
        .count();
    if detect_count != 1 || !matches!(layers.last().map(|l| &l.module), Some(Module::Detect(_))) {
        return Err(ModelError::InvalidModel(
            "expected exactly one Detect head as the last layer".to_string(),
        ));
    }
    let nc = match layers.last().map(|l| &l.module) {
        Some(Module::Detect(detect)) => detect.nc,
        _ => 0,
    };

    let yaml_file = root
        .attr("yaml")
        .and_then(|yaml| yaml.get("yaml_file"))
        .and_then(Value::as_str)
        .map(str::to_string);

    debug!(layers = layers.len(), nc, class = root.class, "parsed detection model");

    Ok(DetectionModel {
        names: parse_names(&root, nc),
        layers,
        yaml_file,
        info: CheckpointInfo::default(),
    })
}
