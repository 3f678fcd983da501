//! Wire protocol: envelope kinds, typed payloads, and framing.
//!
//! Every message on a link is an [`Envelope`] carrying one [`Message`].
//! Envelopes between a given (from, to) pair of ranks carry strictly
//! increasing sequence numbers and are delivered FIFO per pair. Numeric
//! bulk data travels as a self-describing [`NumericArray`]: an element
//! kind, a shape, and contiguous little-endian bytes, never implicitly
//! converted.

pub mod frame;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FlotillaError, Result};

/// Process identifier within a job. Rank 0 is the master.
pub type Rank = u32;

pub const MASTER_RANK: Rank = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: Rank,
    pub to: Rank,
    /// Monotonic per (from, to) pair, starting at 0.
    pub seq: u64,
    pub message: Message,
}

/// The fixed set of envelope kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// First frame on every worker link.
    Hello {
        job_id: Uuid,
        nonce: Uuid,
        claimed_rank: Rank,
    },
    /// Master to worker, once, immediately after handshake.
    JobDescriptor(JobDescriptor),
    /// Worker to master, once, after the descriptor is accepted.
    Ready,
    /// Master to worker, once; starts the kernel.
    Go,
    /// Application payload, any rank to any rank (routed via the master).
    Data(Payload),
    /// Master to workers: fire-and-forget cancellation. A worker may also
    /// send it to the master to request job-wide cancellation.
    Cancel,
    /// Master to workers on job end.
    Shutdown,
    /// Worker to master: kernel returned, with an optional result payload.
    Done(Option<Payload>),
    /// Worker to master: terminal failure.
    Fail { reason: String },
    /// Forwarded worker-to-worker traffic; the inner envelope keeps the
    /// original (from, to, seq).
    Routed(Box<Envelope>),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "HELLO",
            Message::JobDescriptor(_) => "JOB_DESCRIPTOR",
            Message::Ready => "READY",
            Message::Go => "GO",
            Message::Data(_) => "DATA",
            Message::Cancel => "CANCEL",
            Message::Shutdown => "SHUTDOWN",
            Message::Done(_) => "DONE",
            Message::Fail { .. } => "FAIL",
            Message::Routed(_) => "ROUTED",
        }
    }
}

/// Sent by the master to each worker after handshake. All workers in a job
/// see the same `job_id`, `size`, and kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_id: Uuid,
    pub kernel: KernelSpec,
    pub size: u32,
    pub rank: Rank,
}

/// Which kernel a worker runs, with its wire-safe arguments. Matrix inputs
/// are not carried here; they live on rank 0 and reach workers by scatter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KernelSpec {
    Prime {
        n: u64,
    },
    MatMul,
    MonteCarlo {
        num_samples: u64,
        estimator: String,
        reducer: String,
        seed: Option<u64>,
        cancel_check_every: u64,
    },
}

impl KernelSpec {
    pub fn name(&self) -> &'static str {
        match self {
            KernelSpec::Prime { .. } => "prime",
            KernelSpec::MatMul => "matmul",
            KernelSpec::MonteCarlo { .. } => "monte_carlo",
        }
    }
}

/// Statically tagged application payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Empty,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Array(NumericArray),
    List(Vec<Payload>),
}

impl Payload {
    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Payload::Bool(b) => Ok(*b),
            other => Err(type_mismatch("Bool", other)),
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            Payload::Int(v) => Ok(*v),
            other => Err(type_mismatch("Int", other)),
        }
    }

    pub fn as_float(&self) -> Result<f64> {
        match self {
            Payload::Float(v) => Ok(*v),
            other => Err(type_mismatch("Float", other)),
        }
    }

    pub fn as_array(&self) -> Result<&NumericArray> {
        match self {
            Payload::Array(a) => Ok(a),
            other => Err(type_mismatch("Array", other)),
        }
    }

    pub fn as_list(&self) -> Result<&[Payload]> {
        match self {
            Payload::List(items) => Ok(items),
            other => Err(type_mismatch("List", other)),
        }
    }

    pub fn into_list(self) -> Result<Vec<Payload>> {
        match self {
            Payload::List(items) => Ok(items),
            other => Err(type_mismatch("List", &other)),
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            Payload::Empty => "Empty",
            Payload::Bool(_) => "Bool",
            Payload::Int(_) => "Int",
            Payload::Float(_) => "Float",
            Payload::Bytes(_) => "Bytes",
            Payload::Array(_) => "Array",
            Payload::List(_) => "List",
        }
    }
}

fn type_mismatch(expected: &str, got: &Payload) -> FlotillaError {
    FlotillaError::ProtocolViolation(format!(
        "payload type mismatch: expected {expected}, got {}",
        got.tag()
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementKind {
    F64,
    F32,
    I64,
    U64,
}

impl ElementKind {
    pub fn width(self) -> usize {
        match self {
            ElementKind::F32 => 4,
            _ => 8,
        }
    }
}

/// Dense numeric data: element kind, shape, and contiguous little-endian
/// bytes in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericArray {
    pub element: ElementKind,
    pub shape: Vec<usize>,
    pub bytes: Vec<u8>,
}

impl NumericArray {
    pub fn from_f64(shape: Vec<usize>, values: &[f64]) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), values.len());
        let mut bytes = Vec::with_capacity(values.len() * 8);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            element: ElementKind::F64,
            shape,
            bytes,
        }
    }

    pub fn from_i64(shape: Vec<usize>, values: &[i64]) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), values.len());
        let mut bytes = Vec::with_capacity(values.len() * 8);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            element: ElementKind::I64,
            shape,
            bytes,
        }
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    fn check_consistency(&self, expected: ElementKind) -> Result<()> {
        if self.element != expected {
            return Err(FlotillaError::ProtocolViolation(format!(
                "array element mismatch: expected {:?}, got {:?}",
                expected, self.element
            )));
        }
        let want = self.element_count() * self.element.width();
        if self.bytes.len() != want {
            return Err(FlotillaError::ProtocolViolation(format!(
                "array byte length {} does not match shape {:?}",
                self.bytes.len(),
                self.shape
            )));
        }
        Ok(())
    }

    pub fn to_f64(&self) -> Result<Vec<f64>> {
        self.check_consistency(ElementKind::F64)?;
        Ok(self
            .bytes
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
            .collect())
    }

    pub fn to_i64(&self) -> Result<Vec<i64>> {
        self.check_consistency(ElementKind::I64)?;
        Ok(self
            .bytes
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
            .collect())
    }
}
