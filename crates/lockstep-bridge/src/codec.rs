//! Conversions between caller values and the opaque [`Payload`] the bridge
//! carries. The bridge itself never looks inside a payload.

use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use lockstep_proto::{AnyMessage, DataType, Payload, TensorProto};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("expected {expected} payload, found {found}")]
    PayloadKind {
        expected: &'static str,
        found: &'static str,
    },
    #[error("expected {expected:?} tensor, found {found:?}")]
    DataType { expected: DataType, found: DataType },
    #[error("shape {shape:?} does not hold {elements} elements")]
    Shape { shape: Vec<u64>, elements: usize },
    #[error("tensor content of {len} bytes is not a multiple of {element_size}")]
    Content { len: usize, element_size: usize },
    #[error("expected message type {expected}, found {found}")]
    TypeUrl { expected: String, found: String },
    #[error("message encoding failed: {0}")]
    Message(String),
}

/// Pluggable encoding for values sent through the bridge.
pub trait PayloadCodec: Send + Sync {
    type Value;

    fn encode(&self, value: &Self::Value) -> Result<Payload, CodecError>;

    fn decode(&self, payload: Payload) -> Result<Self::Value, CodecError>;
}

/// Numeric element stored little-endian inside a [`TensorProto`].
pub trait TensorElement: Copy + Send + Sync + 'static {
    const DTYPE: DataType;

    fn put(self, out: &mut BytesMut);

    fn take(chunk: &[u8]) -> Self;
}

macro_rules! tensor_element {
    ($ty:ty, $dtype:ident) => {
        impl TensorElement for $ty {
            const DTYPE: DataType = DataType::$dtype;

            fn put(self, out: &mut BytesMut) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn take(chunk: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(chunk);
                <$ty>::from_le_bytes(raw)
            }
        }
    };
}

tensor_element!(f32, F32);
tensor_element!(f64, F64);
tensor_element!(i32, I32);
tensor_element!(i64, I64);
tensor_element!(u8, U8);

/// Dense row-major array. An empty shape is a scalar.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    pub shape: Vec<u64>,
    pub values: Vec<T>,
}

impl<T> Tensor<T> {
    pub fn new(shape: Vec<u64>, values: Vec<T>) -> Self {
        Self { shape, values }
    }

    pub fn vector(values: Vec<T>) -> Self {
        Self {
            shape: vec![values.len() as u64],
            values,
        }
    }
}

/// `None` when the product of the dimensions overflows.
fn element_count(shape: &[u64]) -> Option<u64> {
    shape.iter().try_fold(1u64, |acc, dim| acc.checked_mul(*dim))
}

pub struct TensorCodec<T> {
    _element: PhantomData<fn() -> T>,
}

impl<T> TensorCodec<T> {
    pub fn new() -> Self {
        Self {
            _element: PhantomData,
        }
    }
}

impl<T> Default for TensorCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TensorElement> PayloadCodec for TensorCodec<T> {
    type Value = Tensor<T>;

    fn encode(&self, value: &Tensor<T>) -> Result<Payload, CodecError> {
        if element_count(&value.shape) != Some(value.values.len() as u64) {
            return Err(CodecError::Shape {
                shape: value.shape.clone(),
                elements: value.values.len(),
            });
        }
        let mut content = BytesMut::with_capacity(value.values.len() * T::DTYPE.size_of());
        for element in &value.values {
            element.put(&mut content);
        }
        Ok(Payload::Tensor(TensorProto {
            dtype: T::DTYPE,
            shape: value.shape.clone(),
            content: content.freeze(),
        }))
    }

    fn decode(&self, payload: Payload) -> Result<Tensor<T>, CodecError> {
        let tensor = match payload {
            Payload::Tensor(tensor) => tensor,
            other => {
                return Err(CodecError::PayloadKind {
                    expected: "tensor",
                    found: other.kind(),
                })
            }
        };
        if tensor.dtype != T::DTYPE {
            return Err(CodecError::DataType {
                expected: T::DTYPE,
                found: tensor.dtype,
            });
        }
        let element_size = T::DTYPE.size_of();
        if tensor.content.len() % element_size != 0 {
            return Err(CodecError::Content {
                len: tensor.content.len(),
                element_size,
            });
        }
        let values: Vec<T> = tensor.content.chunks_exact(element_size).map(T::take).collect();
        if element_count(&tensor.shape) != Some(values.len() as u64) {
            return Err(CodecError::Shape {
                shape: tensor.shape,
                elements: values.len(),
            });
        }
        Ok(Tensor {
            shape: tensor.shape,
            values,
        })
    }
}

/// Packs any serde message as an [`AnyMessage`] tagged with `type_url`.
pub struct MessageCodec<M> {
    type_url: String,
    _message: PhantomData<fn() -> M>,
}

impl<M> MessageCodec<M> {
    pub fn new(type_url: impl Into<String>) -> Self {
        Self {
            type_url: type_url.into(),
            _message: PhantomData,
        }
    }
}

impl<M: Serialize + DeserializeOwned> PayloadCodec for MessageCodec<M> {
    type Value = M;

    fn encode(&self, value: &M) -> Result<Payload, CodecError> {
        let value = bincode::serialize(value).map_err(|err| CodecError::Message(err.to_string()))?;
        Ok(Payload::Any(AnyMessage {
            type_url: self.type_url.clone(),
            value: Bytes::from(value),
        }))
    }

    fn decode(&self, payload: Payload) -> Result<M, CodecError> {
        let any = match payload {
            Payload::Any(any) => any,
            other => {
                return Err(CodecError::PayloadKind {
                    expected: "any",
                    found: other.kind(),
                })
            }
        };
        if any.type_url != self.type_url {
            return Err(CodecError::TypeUrl {
                expected: self.type_url.clone(),
                found: any.type_url,
            });
        }
        bincode::deserialize(&any.value).map_err(|err| CodecError::Message(err.to_string()))
    }
}
