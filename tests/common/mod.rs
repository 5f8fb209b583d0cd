//! A tiny YOLOv8-shaped detection checkpoint written the way `torch.save`
//! lays it out: a zip with `data.pkl`, `byteorder` and one storage file per
//! tensor.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use zip::write::FileOptions;

pub const IMGSZ: usize = 64;
pub const NC: usize = 2;
pub const REG_MAX: usize = 4;
/// 8x8 + 4x4 + 2x2 cells at strides 8, 16, 32.
pub const ANCHORS: usize = 84;

pub enum Py {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Py>),
    List(Vec<Py>),
    Dict(Vec<(Py, Py)>),
    /// An object restored through `NEWOBJ` + `BUILD` with `state` as `__dict__`.
    Object {
        module: &'static str,
        class: &'static str,
        state: Vec<(&'static str, Py)>,
    },
    Tensor {
        shape: Vec<usize>,
        data: Vec<f32>,
    },
    /// One object referenced from several places, like the class-level
    /// `Conv.default_act`. Written once, then recalled from the memo by `key`.
    Shared { key: &'static str, value: Box<Py> },
}

fn s(text: &str) -> Py {
    Py::Str(text.to_string())
}

fn ints(values: &[i64]) -> Py {
    Py::Tuple(values.iter().map(|&v| Py::Int(v)).collect())
}

/// Protocol 2 pickle writer covering the opcodes `torch.save` emits for
/// module trees. Dicts, lists and objects are memoized as soon as they are
/// created, before their contents are written.
#[derive(Default)]
pub struct PickleWriter {
    out: Vec<u8>,
    pub storages: Vec<Vec<u8>>,
    next_memo: u32,
    shared: HashMap<&'static str, u32>,
}

impl PickleWriter {
    fn put(&mut self) -> u32 {
        let index = self.next_memo;
        self.next_memo += 1;
        match u8::try_from(index) {
            Ok(short) => self.out.extend([b'q', short]),
            Err(_) => {
                self.out.push(b'r');
                self.out.extend(index.to_le_bytes());
            }
        }
        index
    }

    fn get(&mut self, index: u32) {
        match u8::try_from(index) {
            Ok(short) => self.out.extend([b'h', short]),
            Err(_) => {
                self.out.push(b'j');
                self.out.extend(index.to_le_bytes());
            }
        }
    }

    fn global(&mut self, module: &str, name: &str) {
        self.out.push(b'c');
        self.out.extend(module.as_bytes());
        self.out.push(b'\n');
        self.out.extend(name.as_bytes());
        self.out.push(b'\n');
    }

    fn write(&mut self, value: &Py) {
        match value {
            Py::None => self.out.push(b'N'),
            Py::Bool(true) => self.out.push(0x88),
            Py::Bool(false) => self.out.push(0x89),
            Py::Int(i) => {
                self.out.push(b'J');
                self.out.extend((*i as i32).to_le_bytes());
            }
            Py::Float(f) => {
                self.out.push(b'G');
                self.out.extend(f.to_be_bytes());
            }
            Py::Str(text) => {
                self.out.push(b'X');
                self.out.extend((text.len() as u32).to_le_bytes());
                self.out.extend(text.as_bytes());
            }
            Py::Tuple(items) => {
                self.out.push(b'(');
                items.iter().for_each(|item| self.write(item));
                self.out.push(b't');
            }
            Py::List(items) => {
                self.out.push(b']');
                self.put();
                self.out.push(b'(');
                items.iter().for_each(|item| self.write(item));
                self.out.push(b'e');
            }
            Py::Dict(items) => {
                self.out.push(b'}');
                self.put();
                self.out.push(b'(');
                for (k, v) in items {
                    self.write(k);
                    self.write(v);
                }
                self.out.push(b'u');
            }
            Py::Object { module, class, state } => {
                self.global(module, class);
                self.out.extend([b')', 0x81]);
                self.put();
                self.out.push(b'}');
                self.put();
                self.out.push(b'(');
                for (k, v) in state {
                    self.write(&s(k));
                    self.write(v);
                }
                self.out.extend([b'u', b'b']);
            }
            Py::Tensor { shape, data } => {
                let key = self.storages.len().to_string();
                self.storages
                    .push(data.iter().flat_map(|v| v.to_le_bytes()).collect());

                self.global("torch._utils", "_rebuild_tensor_v2");
                self.out.push(b'(');
                // persistent id: ('storage', FloatStorage, key, 'cpu', numel)
                self.out.push(b'(');
                self.write(&s("storage"));
                self.global("torch", "FloatStorage");
                self.write(&s(&key));
                self.write(&s("cpu"));
                self.write(&Py::Int(data.len() as i64));
                self.out.extend([b't', b'Q']);

                let mut stride = vec![1i64; shape.len()];
                for i in (0..shape.len().saturating_sub(1)).rev() {
                    stride[i] = stride[i + 1] * shape[i + 1] as i64;
                }
                self.write(&Py::Int(0));
                self.write(&ints(&shape.iter().map(|&d| d as i64).collect::<Vec<_>>()));
                self.write(&ints(&stride));
                self.write(&Py::Bool(false));
                self.global("collections", "OrderedDict");
                self.out.extend([b')', b'R']);
                self.out.extend([b't', b'R']);
            }
            Py::Shared { key, value } => match self.shared.get(key).copied() {
                Some(index) => self.get(index),
                None => {
                    // the first memo slot taken while writing `value` is its own
                    let index = self.next_memo;
                    self.write(value);
                    self.shared.insert(*key, index);
                }
            },
        }
    }

    pub fn finish(mut self, root: &Py) -> (Vec<u8>, Vec<Vec<u8>>) {
        self.out.extend([0x80, 0x02]);
        self.write(root);
        self.out.push(b'.');
        (self.out, self.storages)
    }
}

/// Deterministic small values so repeated fixtures are byte-identical.
struct Values(u32);

impl Values {
    fn take(&mut self, n: usize, scale: f32) -> Vec<f32> {
        (0..n)
            .map(|_| {
                self.0 = self.0.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                ((self.0 >> 16) % 2001) as f32 / 1000.0 * scale - scale
            })
            .collect()
    }
}

fn tensor(shape: Vec<usize>, data: Vec<f32>) -> Py {
    Py::Tensor { shape, data }
}

fn params(items: Vec<(&str, Py)>) -> Py {
    Py::Dict(items.into_iter().map(|(k, v)| (s(k), v)).collect())
}

fn modules(items: Vec<(&str, Py)>) -> Py {
    params(items)
}

fn module(module: &'static str, class: &'static str, mut state: Vec<(&'static str, Py)>, children: Vec<(&str, Py)>) -> Py {
    let mut full = vec![
        ("training", Py::Bool(false)),
        ("_parameters", params(Vec::new())),
        ("_buffers", params(Vec::new())),
        ("_modules", modules(children)),
    ];
    // parameters and buffers given in `state` replace the empty tables
    for (key, value) in state.drain(..) {
        match full.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => full.push((key, value)),
        }
    }
    Py::Object { module, class, state: full }
}

fn conv2d(v: &mut Values, c1: usize, c2: usize, k: usize, stride: usize, bias: bool) -> Py {
    let p = (k / 2) as i64;
    let weight = tensor(vec![c2, c1, k, k], v.take(c2 * c1 * k * k, 0.2));
    let bias = if bias { tensor(vec![c2], v.take(c2, 0.1)) } else { Py::None };
    module(
        "torch.nn.modules.conv",
        "Conv2d",
        vec![
            ("_parameters", params(vec![("weight", weight), ("bias", bias)])),
            ("in_channels", Py::Int(c1 as i64)),
            ("out_channels", Py::Int(c2 as i64)),
            ("kernel_size", ints(&[k as i64, k as i64])),
            ("stride", ints(&[stride as i64, stride as i64])),
            ("padding", ints(&[p, p])),
            ("dilation", ints(&[1, 1])),
            ("transposed", Py::Bool(false)),
            ("output_padding", ints(&[0, 0])),
            ("groups", Py::Int(1)),
            ("padding_mode", s("zeros")),
        ],
        Vec::new(),
    )
}

fn batch_norm(v: &mut Values, c: usize) -> Py {
    let var: Vec<f32> = v.take(c, 0.5).into_iter().map(|x| x.abs() + 0.5).collect();
    module(
        "torch.nn.modules.batchnorm",
        "BatchNorm2d",
        vec![
            (
                "_parameters",
                params(vec![
                    ("weight", tensor(vec![c], v.take(c, 0.5).into_iter().map(|x| x + 1.0).collect())),
                    ("bias", tensor(vec![c], v.take(c, 0.1))),
                ]),
            ),
            (
                "_buffers",
                params(vec![
                    ("running_mean", tensor(vec![c], v.take(c, 0.1))),
                    ("running_var", tensor(vec![c], var)),
                ]),
            ),
            ("num_features", Py::Int(c as i64)),
            ("eps", Py::Float(0.001)),
            ("momentum", Py::Float(0.03)),
            ("affine", Py::Bool(true)),
            ("track_running_stats", Py::Bool(true)),
        ],
        Vec::new(),
    )
}

fn conv(v: &mut Values, c1: usize, c2: usize, k: usize, stride: usize, layer: Option<(i64, Py)>) -> Py {
    let mut state = Vec::new();
    if let Some((i, f)) = layer {
        state.push(("i", Py::Int(i)));
        state.push(("f", f));
        state.push(("type", s("ultralytics.nn.modules.conv.Conv")));
    }
    module(
        "ultralytics.nn.modules.conv",
        "Conv",
        state,
        vec![
            ("conv", conv2d(v, c1, c2, k, stride, false)),
            ("bn", batch_norm(v, c2)),
            ("act", default_act()),
        ],
    )
}

/// `Conv.default_act`: a single `nn.SiLU()` shared by every `Conv`.
fn default_act() -> Py {
    Py::Shared {
        key: "default_act",
        value: Box::new(module("torch.nn.modules.activation", "SiLU", vec![("inplace", Py::Bool(false))], Vec::new())),
    }
}

fn layer(i: i64, f: Py) -> Option<(i64, Py)> {
    Some((i, f))
}

fn c2f(v: &mut Values, i: i64, c1: usize, c2: usize) -> Py {
    let c = c2 / 2;
    let bottleneck = module(
        "ultralytics.nn.modules.block",
        "Bottleneck",
        vec![("add", Py::Bool(true))],
        vec![
            ("cv1", conv(v, c, c, 3, 1, None)),
            ("cv2", conv(v, c, c, 3, 1, None)),
        ],
    );
    module(
        "ultralytics.nn.modules.block",
        "C2f",
        vec![("c", Py::Int(c as i64)), ("i", Py::Int(i)), ("f", Py::Int(-1))],
        vec![
            ("cv1", conv(v, c1, 2 * c, 1, 1, None)),
            ("cv2", conv(v, 3 * c, c2, 1, 1, None)),
            (
                "m",
                module("torch.nn.modules.container", "ModuleList", Vec::new(), vec![("0", bottleneck)]),
            ),
        ],
    )
}

fn sppf(v: &mut Values, i: i64, c1: usize, c2: usize, k: usize) -> Py {
    let c = c1 / 2;
    module(
        "ultralytics.nn.modules.block",
        "SPPF",
        vec![("i", Py::Int(i)), ("f", Py::Int(-1))],
        vec![
            ("cv1", conv(v, c1, c, 1, 1, None)),
            ("cv2", conv(v, c * 4, c2, 1, 1, None)),
            (
                "m",
                module(
                    "torch.nn.modules.pooling",
                    "MaxPool2d",
                    vec![
                        ("kernel_size", Py::Int(k as i64)),
                        ("stride", Py::Int(1)),
                        ("padding", Py::Int((k / 2) as i64)),
                        ("dilation", Py::Int(1)),
                        ("return_indices", Py::Bool(false)),
                        ("ceil_mode", Py::Bool(false)),
                    ],
                    Vec::new(),
                ),
            ),
        ],
    )
}

fn head_branch(v: &mut Values, c1: usize, hidden: usize, out: usize) -> Py {
    module(
        "torch.nn.modules.container",
        "Sequential",
        Vec::new(),
        vec![
            ("0", conv(v, c1, hidden, 3, 1, None)),
            ("1", conv(v, hidden, hidden, 3, 1, None)),
            ("2", conv2d(v, hidden, out, 1, 1, true)),
        ],
    )
}

fn detect(v: &mut Values, i: i64, ch: &[usize]) -> Py {
    let hidden = 16;
    let cv2: Vec<(String, Py)> = ch
        .iter()
        .enumerate()
        .map(|(k, &c)| (k.to_string(), head_branch(v, c, hidden, 4 * REG_MAX)))
        .collect();
    let cv3: Vec<(String, Py)> = ch
        .iter()
        .enumerate()
        .map(|(k, &c)| (k.to_string(), head_branch(v, c, hidden, NC)))
        .collect();
    let list = |items: Vec<(String, Py)>| {
        Py::Object {
            module: "torch.nn.modules.container",
            class: "ModuleList",
            state: vec![
                ("training", Py::Bool(false)),
                ("_parameters", params(Vec::new())),
                ("_buffers", params(Vec::new())),
                ("_modules", Py::Dict(items.into_iter().map(|(k, v)| (Py::Str(k), v)).collect())),
            ],
        }
    };

    let dfl_weight = tensor(vec![1, REG_MAX, 1, 1], (0..REG_MAX).map(|x| x as f32).collect());
    let dfl_conv = module(
        "torch.nn.modules.conv",
        "Conv2d",
        vec![
            ("_parameters", params(vec![("weight", dfl_weight), ("bias", Py::None)])),
            ("kernel_size", ints(&[1, 1])),
            ("stride", ints(&[1, 1])),
            ("padding", ints(&[0, 0])),
            ("dilation", ints(&[1, 1])),
            ("groups", Py::Int(1)),
            ("padding_mode", s("zeros")),
        ],
        Vec::new(),
    );

    module(
        "ultralytics.nn.modules.head",
        "Detect",
        vec![
            ("i", Py::Int(i)),
            ("f", Py::List(vec![Py::Int(7), Py::Int(8), Py::Int(9)])),
            ("nc", Py::Int(NC as i64)),
            ("nl", Py::Int(ch.len() as i64)),
            ("reg_max", Py::Int(REG_MAX as i64)),
            ("no", Py::Int((NC + 4 * REG_MAX) as i64)),
            ("stride", tensor(vec![3], vec![8.0, 16.0, 32.0])),
            ("dynamic", Py::Bool(false)),
            ("export", Py::Bool(false)),
        ],
        vec![
            ("cv2", list(cv2)),
            ("cv3", list(cv3)),
            (
                "dfl",
                module(
                    "ultralytics.nn.modules.block",
                    "DFL",
                    vec![("c1", Py::Int(REG_MAX as i64))],
                    vec![("conv", dfl_conv)],
                ),
            ),
        ],
    )
}

/// Backbone of stride-2 convs with C2f and SPPF, one upsample/concat path and
/// a three-level Detect head over layers 7, 8 and 9.
pub fn detection_model() -> Py {
    let mut v = Values(7);
    let prev = || Py::Int(-1);
    let layers = vec![
        ("0", conv(&mut v, 3, 4, 3, 2, layer(0, prev()))),
        ("1", conv(&mut v, 4, 8, 3, 2, layer(1, prev()))),
        ("2", conv(&mut v, 8, 8, 3, 2, layer(2, prev()))),
        ("3", c2f(&mut v, 3, 8, 8)),
        ("4", conv(&mut v, 8, 8, 3, 2, layer(4, prev()))),
        ("5", sppf(&mut v, 5, 8, 8, 5)),
        (
            "6",
            module(
                "torch.nn.modules.upsampling",
                "Upsample",
                vec![
                    ("i", Py::Int(6)),
                    ("f", Py::Int(-1)),
                    ("size", Py::None),
                    ("scale_factor", Py::Float(2.0)),
                    ("mode", s("nearest")),
                    ("align_corners", Py::None),
                ],
                Vec::new(),
            ),
        ),
        (
            "7",
            module(
                "ultralytics.nn.modules.conv",
                "Concat",
                vec![
                    ("i", Py::Int(7)),
                    ("f", Py::List(vec![Py::Int(-1), Py::Int(3)])),
                    ("d", Py::Int(1)),
                ],
                Vec::new(),
            ),
        ),
        ("8", conv(&mut v, 16, 8, 3, 2, layer(8, prev()))),
        ("9", conv(&mut v, 8, 8, 3, 2, layer(9, prev()))),
        ("10", detect(&mut v, 10, &[16, 8, 8])),
    ];

    module(
        "ultralytics.nn.tasks",
        "DetectionModel",
        vec![
            (
                "yaml",
                params(vec![("yaml_file", s("yolov8t.yaml")), ("nc", Py::Int(NC as i64))]),
            ),
            (
                "names",
                Py::Dict(vec![(Py::Int(0), s("cat")), (Py::Int(1), s("dog"))]),
            ),
            ("stride", tensor(vec![3], vec![8.0, 16.0, 32.0])),
        ],
        vec![(
            "model",
            module("torch.nn.modules.container", "Sequential", Vec::new(), layers),
        )],
    )
}

/// The dict `ultralytics` saves: model plus training provenance.
pub fn checkpoint() -> Py {
    params(vec![
        ("epoch", Py::Int(-1)),
        ("best_fitness", Py::None),
        ("model", detection_model()),
        ("ema", Py::None),
        ("updates", Py::None),
        ("optimizer", Py::None),
        ("train_args", params(vec![("imgsz", Py::Int(IMGSZ as i64)), ("task", s("detect"))])),
        ("version", s("8.2.0")),
        ("license", s("AGPL-3.0 License (https://ultralytics.com/license)")),
        ("docs", s("https://docs.ultralytics.com")),
    ])
}

pub fn write_checkpoint(path: &Path) {
    let (pickle, storages) = PickleWriter::default().finish(&checkpoint());
    let prefix = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("archive")
        .to_string();

    let file = File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    zip.start_file(format!("{}/data.pkl", prefix), options).unwrap();
    zip.write_all(&pickle).unwrap();
    zip.start_file(format!("{}/byteorder", prefix), options).unwrap();
    zip.write_all(b"little").unwrap();
    for (key, bytes) in storages.iter().enumerate() {
        zip.start_file(format!("{}/data/{}", prefix, key), options).unwrap();
        zip.write_all(bytes).unwrap();
    }
    zip.start_file(format!("{}/version", prefix), options).unwrap();
    zip.write_all(b"3\n").unwrap();
    zip.finish().unwrap();
}
