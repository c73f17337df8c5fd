//! Model-side descriptors the layer window operates on.
//!
//! The window never parses model files or builds compute graphs; it sees each
//! layer as an ordered list of tensor descriptors whose `data`/`buffer`
//! fields it may rebind, plus a [`WeightSource`] that can produce the raw
//! weight bytes of RAM-resident layers for staging.

use crate::gpu::backend::BufferId;

/// One weight tensor's descriptor.
///
/// The descriptor itself is the stable identity a pre-compiled compute graph
/// refers to; tier movement rewrites only `data` and `buffer`, never the
/// descriptor's slot in its layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDesc {
    /// Tensor name (e.g. "attn_q.weight").
    pub name: String,

    /// Payload size in bytes.
    pub nbytes: usize,

    /// Current data address.
    pub data: usize,

    /// Buffer currently backing `data`.
    pub buffer: BufferId,
}

/// All weight tensors of one transformer layer, in graph order.
#[derive(Debug, Clone, Default)]
pub struct LayerWeights {
    /// Layer index.
    pub il: usize,

    /// Tensor descriptors; their order fixes staging offsets.
    pub tensors: Vec<TensorDesc>,
}

impl LayerWeights {
    pub fn new(il: usize) -> Self {
        Self {
            il,
            tensors: Vec::new(),
        }
    }

    /// Append a tensor descriptor.
    pub fn push_tensor(&mut self, name: &str, nbytes: usize, data: usize, buffer: BufferId) {
        self.tensors.push(TensorDesc {
            name: name.to_string(),
            nbytes,
            data,
            buffer,
        });
    }

    /// Total weight bytes across all tensors.
    pub fn weight_bytes(&self) -> usize {
        self.tensors.iter().map(|t| t.nbytes).sum()
    }
}

/// Produces the raw weight payload of a RAM-resident layer.
///
/// The background loader copies from here into the staging host buffer; the
/// payload layout must match the concatenation order of the layer's tensors.
pub trait WeightSource: Send + Sync {
    /// Fill `dst` with layer `il`'s weight bytes.
    fn read_layer(&self, il: usize, dst: &mut [u8]) -> std::io::Result<()>;
}

/// In-memory weight source: one heap payload per layer.
pub struct HostWeights {
    layers: Vec<Vec<u8>>,
}

impl HostWeights {
    pub fn new(layers: Vec<Vec<u8>>) -> Self {
        Self { layers }
    }

    /// Payload size of a layer, 0 when out of range.
    pub fn layer_nbytes(&self, il: usize) -> usize {
        self.layers.get(il).map_or(0, Vec::len)
    }
}

impl WeightSource for HostWeights {
    fn read_layer(&self, il: usize, dst: &mut [u8]) -> std::io::Result<()> {
        let src = self.layers.get(il).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no weights for layer {il}"),
            )
        })?;

        if dst.len() < src.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "destination too small for layer {il}: {} < {}",
                    dst.len(),
                    src.len()
                ),
            ));
        }

        dst[..src.len()].copy_from_slice(src);
        Ok(())
    }
}
