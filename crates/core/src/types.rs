use std::fmt;
use std::marker::PhantomData;

use half::{bf16, f16};
use ndarray::{ArrayBase, Data, DataMut, Dimension};
use serde::{Deserialize, Serialize};

/// Element type of a tensor buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    U8,
    F16,
    BF16,
    F32,
    F64,
    I32,
    I64,
    Bool,
}

impl DType {
    pub fn name(self) -> &'static str {
        match self {
            Self::U8 => "uint8",
            Self::F16 => "float16",
            Self::BF16 => "bfloat16",
            Self::F32 => "float32",
            Self::F64 => "float64",
            Self::I32 => "int32",
            Self::I64 => "int64",
            Self::Bool => "bool",
        }
    }

    /// Device-side C type used to resolve `{{type}}`, or `None` when kernels
    /// cannot be generated for this element type.
    pub fn c_type(self) -> Option<&'static str> {
        match self {
            Self::U8 => Some("unsigned char"),
            Self::F16 => Some("half"),
            Self::F32 => Some("float"),
            Self::F64 => Some("double"),
            Self::I32 => Some("int"),
            Self::I64 => Some("long"),
            Self::BF16 | Self::Bool => None,
        }
    }

    pub fn size_bytes(self) -> usize {
        match self {
            Self::U8 | Self::Bool => 1,
            Self::F16 | Self::BF16 => 2,
            Self::F32 | Self::I32 => 4,
            Self::F64 | Self::I64 => 8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rust element types that can back a [`TensorDescriptor`].
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DType;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(impl Element for $ty {
            const DTYPE: DType = DType::$dtype;
        })*
    };
}

impl_element! {
    u8 => U8,
    f16 => F16,
    bf16 => BF16,
    f32 => F32,
    f64 => F64,
    i32 => I32,
    i64 => I64,
    bool => Bool,
}

/// Read-only structural view of a caller-owned dense buffer.
///
/// The descriptor never copies the buffer. It borrows the owning array for
/// `'buf`, so the buffer outlives every kernel launch that receives it.
/// Strides are counted in elements and may be negative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDescriptor<'buf> {
    dtype: DType,
    shape: Vec<usize>,
    strides: Vec<isize>,
    device_ptr: usize,
    writable: bool,
    _buffer: PhantomData<&'buf ()>,
}

impl<'buf> TensorDescriptor<'buf> {
    /// Describe an array the kernel may only read.
    pub fn of<S, D>(array: &'buf ArrayBase<S, D>) -> Self
    where
        S: Data,
        S::Elem: Element,
        D: Dimension,
    {
        Self {
            dtype: S::Elem::DTYPE,
            shape: array.shape().to_vec(),
            strides: array.strides().to_vec(),
            device_ptr: array.as_ptr() as usize,
            writable: false,
            _buffer: PhantomData,
        }
    }

    /// Describe an array the kernel may write into.
    pub fn of_mut<S, D>(array: &'buf mut ArrayBase<S, D>) -> Self
    where
        S: DataMut,
        S::Elem: Element,
        D: Dimension,
    {
        Self {
            dtype: S::Elem::DTYPE,
            shape: array.shape().to_vec(),
            strides: array.strides().to_vec(),
            device_ptr: array.as_mut_ptr() as usize,
            writable: true,
            _buffer: PhantomData,
        }
    }

    /// A descriptor with structure but no buffer. Good for template
    /// resolution and cache keys; launching with it is rejected.
    pub fn layout_only(dtype: DType, shape: &[usize], strides: &[isize]) -> Self {
        Self {
            dtype,
            shape: shape.to_vec(),
            strides: strides.to_vec(),
            device_ptr: 0,
            writable: false,
            _buffer: PhantomData,
        }
    }

    /// Row-major strides for `shape`.
    pub fn contiguous_strides(shape: &[usize]) -> Vec<isize> {
        let mut strides = vec![0isize; shape.len()];
        let mut acc = 1isize;
        for (stride, &extent) in strides.iter_mut().zip(shape).rev() {
            *stride = acc;
            acc *= extent.max(1) as isize;
        }
        strides
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn device_ptr(&self) -> usize {
        self.device_ptr
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn has_buffer(&self) -> bool {
        self.device_ptr != 0
    }

    /// Structural fingerprint: `dtype[shape][strides]`, buffer contents excluded.
    pub fn structure(&self) -> String {
        format!("{}{:?}{:?}", self.dtype, self.shape, self.strides)
    }
}

/// One named template parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding<'buf> {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Tensor(TensorDescriptor<'buf>),
}

impl Binding<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Str(_) => "string",
            Self::Tensor(_) => "tensor",
        }
    }

    /// Text substituted for a `{{name}}` placeholder. Tensors have none.
    pub fn scalar_text(&self) -> Option<String> {
        match self {
            Self::Int(v) => Some(v.to_string()),
            Self::Float(v) => Some(format!("{v:?}")),
            Self::Bool(v) => Some(v.to_string()),
            Self::Str(v) => Some(v.clone()),
            Self::Tensor(_) => None,
        }
    }

    /// Serialization used inside cache keys. Strings are quoted so they
    /// never read as another kind.
    pub fn key_text(&self) -> String {
        match self {
            Self::Tensor(desc) => desc.structure(),
            Self::Str(v) => format!("{v:?}"),
            other => other.scalar_text().unwrap_or_default(),
        }
    }
}

/// Insertion-ordered name → binding map handed to the template compiler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindingSet<'buf> {
    entries: Vec<(String, Binding<'buf>)>,
}

impl<'buf> BindingSet<'buf> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Bind `name`; a second binding for the same name replaces the first in place.
    pub fn bind(&mut self, name: &str, binding: Binding<'buf>) -> &mut Self {
        match self.entries.iter_mut().find(|(existing, _)| existing == name) {
            Some((_, slot)) => *slot = binding,
            None => self.entries.push((name.to_string(), binding)),
        }
        self
    }

    pub fn with_int(mut self, name: &str, value: i64) -> Self {
        self.bind(name, Binding::Int(value));
        self
    }

    pub fn with_float(mut self, name: &str, value: f64) -> Self {
        self.bind(name, Binding::Float(value));
        self
    }

    pub fn with_bool(mut self, name: &str, value: bool) -> Self {
        self.bind(name, Binding::Bool(value));
        self
    }

    pub fn with_str(mut self, name: &str, value: &str) -> Self {
        self.bind(name, Binding::Str(value.to_string()));
        self
    }

    pub fn with_tensor(mut self, name: &str, desc: TensorDescriptor<'buf>) -> Self {
        self.bind(name, Binding::Tensor(desc));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Binding<'buf>> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, binding)| binding)
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorDescriptor<'buf>> {
        match self.get(name)? {
            Binding::Tensor(desc) => Some(desc),
            _ => None,
        }
    }

    /// First tensor binding in insertion order; its dtype resolves `{{type}}`.
    pub fn designated_tensor(&self) -> Option<(&str, &TensorDescriptor<'buf>)> {
        self.entries.iter().find_map(|(name, binding)| match binding {
            Binding::Tensor(desc) => Some((name.as_str(), desc)),
            _ => None,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Binding<'buf>)> {
        self.entries
            .iter()
            .map(|(name, binding)| (name.as_str(), binding))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
