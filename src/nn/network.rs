//! Feed-forward network structure, weight files and the forward pass.
//!
//! Architecture: `inputs -> hidden -> outputs`, sigmoid on both layers.
//! Hidden weights are stored input-major so that one input selects one
//! contiguous row, which lets the pass skip zero inputs and apply incremental
//! differences row by row.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use rand::Rng;

use super::sigmoid::sigmoid;
use super::simd::{Backend, Kernel, ScalarKernel};
use super::state::{IncrementalState, StateMarker};
use crate::error::WeightsError;

#[cfg(target_arch = "x86_64")]
use super::simd::Avx2Kernel;
#[cfg(target_arch = "aarch64")]
use super::simd::NeonKernel;

/// First value of a binary weights file.
pub const WEIGHTS_MAGIC: f32 = 472.3782;

/// Version written to and accepted from weights files.
pub const WEIGHTS_VERSION: f32 = 1.0;

/// Header keyword of a text weights file.
pub const TEXT_HEADER: &str = "nnweights";

pub const MAX_INPUTS: usize = 1024;
pub const MAX_HIDDEN: usize = 1024;
pub const MAX_OUTPUTS: usize = 16;

/// Raw parts of a network, validated by [`NeuralNet::from_params`].
#[derive(Clone, Debug, Default)]
pub struct NetParams {
    pub inputs: usize,
    pub hidden: usize,
    pub outputs: usize,
    pub trained: bool,
    pub beta_hidden: f32,
    pub beta_output: f32,
    /// `[input][hidden]`
    pub hidden_weights: Vec<f32>,
    /// `[output][hidden]`
    pub output_weights: Vec<f32>,
    pub hidden_thresholds: Vec<f32>,
    pub output_thresholds: Vec<f32>,
}

/// Immutable network weights.
#[derive(Clone, Debug)]
pub struct NeuralNet {
    inputs: usize,
    hidden: usize,
    outputs: usize,
    trained: bool,
    beta_hidden: f32,
    beta_output: f32,
    hidden_weights: Box<[f32]>,
    output_weights: Box<[f32]>,
    hidden_thresholds: Box<[f32]>,
    output_thresholds: Box<[f32]>,
    backend: Backend,
}

fn check_dimensions(net: usize, inputs: i64, hidden: i64, outputs: i64) -> Result<(), WeightsError> {
    let ok = (1..=MAX_INPUTS as i64).contains(&inputs)
        && (1..=MAX_HIDDEN as i64).contains(&hidden)
        && (1..=MAX_OUTPUTS as i64).contains(&outputs);
    if ok {
        Ok(())
    } else {
        Err(WeightsError::BadDimensions {
            net,
            inputs,
            hidden,
            outputs,
        })
    }
}

impl NeuralNet {
    /// Build a network from its parts, checking dimensions and array lengths.
    pub fn from_params(params: NetParams) -> Result<Self, WeightsError> {
        Self::from_params_indexed(params, 0)
    }

    fn from_params_indexed(params: NetParams, net: usize) -> Result<Self, WeightsError> {
        let NetParams {
            inputs,
            hidden,
            outputs,
            trained,
            beta_hidden,
            beta_output,
            hidden_weights,
            output_weights,
            hidden_thresholds,
            output_thresholds,
        } = params;

        check_dimensions(net, inputs as i64, hidden as i64, outputs as i64)?;

        let lengths_ok = hidden_weights.len() == inputs * hidden
            && output_weights.len() == outputs * hidden
            && hidden_thresholds.len() == hidden
            && output_thresholds.len() == outputs;
        if !lengths_ok {
            return Err(WeightsError::Truncated { net });
        }

        Ok(Self {
            inputs,
            hidden,
            outputs,
            trained,
            beta_hidden,
            beta_output,
            hidden_weights: hidden_weights.into_boxed_slice(),
            output_weights: output_weights.into_boxed_slice(),
            hidden_thresholds: hidden_thresholds.into_boxed_slice(),
            output_thresholds: output_thresholds.into_boxed_slice(),
            backend: Backend::detect(),
        })
    }

    /// Untrained network with small uniform random weights.
    pub fn random<R: Rng>(
        inputs: usize,
        hidden: usize,
        outputs: usize,
        rng: &mut R,
    ) -> Result<Self, WeightsError> {
        check_dimensions(0, inputs as i64, hidden as i64, outputs as i64)?;
        let mut fill = |n: usize| (0..n).map(|_| rng.gen_range(-0.1f32..0.1)).collect::<Vec<_>>();
        let hidden_weights = fill(inputs * hidden);
        let output_weights = fill(outputs * hidden);
        let hidden_thresholds = fill(hidden);
        let output_thresholds = fill(outputs);
        Self::from_params(NetParams {
            inputs,
            hidden,
            outputs,
            trained: false,
            beta_hidden: 0.1,
            beta_output: 1.0,
            hidden_weights,
            output_weights,
            hidden_thresholds,
            output_thresholds,
        })
    }

    #[inline]
    #[must_use]
    pub fn inputs(&self) -> usize {
        self.inputs
    }

    #[inline]
    #[must_use]
    pub fn hidden(&self) -> usize {
        self.hidden
    }

    #[inline]
    #[must_use]
    pub fn outputs(&self) -> usize {
        self.outputs
    }

    #[must_use]
    pub fn is_trained(&self) -> bool {
        self.trained
    }

    #[must_use]
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Select the kernel used by [`NeuralNet::evaluate`]. Backends the CPU
    /// cannot run fall back to scalar.
    pub fn set_backend(&mut self, backend: Backend) {
        if backend.is_supported() {
            self.backend = backend;
        } else {
            log::warn!(
                "{} kernels not supported on this CPU, using scalar",
                backend.name()
            );
            self.backend = Backend::Scalar;
        }
    }

    #[inline]
    fn hidden_row(&self, input: usize) -> &[f32] {
        &self.hidden_weights[input * self.hidden..(input + 1) * self.hidden]
    }

    #[inline]
    fn output_row(&self, output: usize) -> &[f32] {
        &self.output_weights[output * self.hidden..(output + 1) * self.hidden]
    }

    /// Run the forward pass.
    ///
    /// `scratch` is resized to the hidden layer and reused between calls.
    /// With a `state`, the pass saves or reuses a base according to its
    /// [`StateMarker`]. Writes `outputs()` values in `(0, 1)`.
    ///
    /// # Panics
    ///
    /// Panics if `inputs` or `outputs` have the wrong length.
    pub fn evaluate(
        &self,
        inputs: &[f32],
        scratch: &mut Vec<f32>,
        outputs: &mut [f32],
        state: Option<&mut IncrementalState>,
    ) {
        assert_eq!(inputs.len(), self.inputs, "input length mismatch");
        assert_eq!(outputs.len(), self.outputs, "output length mismatch");
        scratch.resize(self.hidden, 0.0);

        match self.backend {
            Backend::Scalar => self.forward::<ScalarKernel>(inputs, scratch, outputs, state),
            #[cfg(target_arch = "x86_64")]
            Backend::Avx2 => self.forward::<Avx2Kernel>(inputs, scratch, outputs, state),
            #[cfg(target_arch = "aarch64")]
            Backend::Neon => self.forward::<NeonKernel>(inputs, scratch, outputs, state),
        }
    }

    /// Plain forward pass returning a fresh output vector.
    #[must_use]
    pub fn evaluate_simple(&self, inputs: &[f32]) -> Vec<f32> {
        let mut scratch = Vec::with_capacity(self.hidden);
        let mut outputs = vec![0.0; self.outputs];
        self.evaluate(inputs, &mut scratch, &mut outputs, None);
        outputs
    }

    fn forward<K: Kernel>(
        &self,
        inputs: &[f32],
        hidden: &mut [f32],
        outputs: &mut [f32],
        state: Option<&mut IncrementalState>,
    ) {
        match state {
            Some(state) if state.marker() == StateMarker::Complete => {
                if state.prepare_diff(inputs, self.hidden) {
                    hidden.copy_from_slice(state.saved_hidden());
                    self.accumulate::<K>(hidden, state.diff());
                } else {
                    self.accumulate_fresh::<K>(hidden, inputs);
                }
            }
            Some(state) if state.marker() == StateMarker::Incremental => {
                self.accumulate_fresh::<K>(hidden, inputs);
                state.save(inputs, hidden);
            }
            _ => self.accumulate_fresh::<K>(hidden, inputs),
        }

        K::activate(hidden, self.beta_hidden);

        for (o, out) in outputs.iter_mut().enumerate() {
            let sum = K::dot(hidden, self.output_row(o)) + self.output_thresholds[o];
            *out = sigmoid(-self.beta_output * sum);
        }
    }

    #[inline]
    fn accumulate_fresh<K: Kernel>(&self, hidden: &mut [f32], inputs: &[f32]) {
        hidden.copy_from_slice(&self.hidden_thresholds);
        self.accumulate::<K>(hidden, inputs);
    }

    /// Add `values[i] * row(i)` for every non-zero value. Exact ±1 skip the multiply.
    #[inline]
    fn accumulate<K: Kernel>(&self, hidden: &mut [f32], values: &[f32]) {
        for (i, &v) in values.iter().enumerate() {
            if v == 0.0 {
                continue;
            }
            let row = self.hidden_row(i);
            if v == 1.0 {
                K::add_row(hidden, row);
            } else if v == -1.0 {
                K::sub_row(hidden, row);
            } else {
                K::add_scaled_row(hidden, row, v);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Binary format
    // ------------------------------------------------------------------------

    fn read_binary<R: Read>(reader: &mut R, net: usize) -> Result<Option<Self>, WeightsError> {
        let mut first = [0u8; 4];
        if !read_or_eof(reader, &mut first, net)? {
            return Ok(None);
        }

        let inputs = i32::from_le_bytes(first);
        let hidden = read_i32(reader, net)?;
        let outputs = read_i32(reader, net)?;
        let trained = read_i32(reader, net)?;
        check_dimensions(net, i64::from(inputs), i64::from(hidden), i64::from(outputs))?;
        let (inputs, hidden, outputs) = (inputs as usize, hidden as usize, outputs as usize);

        let beta_hidden = read_f32(reader, net)?;
        let beta_output = read_f32(reader, net)?;
        let hidden_weights = read_f32s(reader, inputs * hidden, net)?;
        let output_weights = read_f32s(reader, outputs * hidden, net)?;
        let hidden_thresholds = read_f32s(reader, hidden, net)?;
        let output_thresholds = read_f32s(reader, outputs, net)?;

        Self::from_params_indexed(
            NetParams {
                inputs,
                hidden,
                outputs,
                trained: trained != 0,
                beta_hidden,
                beta_output,
                hidden_weights,
                output_weights,
                hidden_thresholds,
                output_thresholds,
            },
            net,
        )
        .map(Some)
    }

    fn write_binary<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        for v in [self.inputs, self.hidden, self.outputs] {
            writer.write_all(&(v as i32).to_le_bytes())?;
        }
        writer.write_all(&i32::from(self.trained).to_le_bytes())?;
        writer.write_all(&self.beta_hidden.to_le_bytes())?;
        writer.write_all(&self.beta_output.to_le_bytes())?;
        for arr in [
            &self.hidden_weights,
            &self.output_weights,
            &self.hidden_thresholds,
            &self.output_thresholds,
        ] {
            for v in arr.iter() {
                writer.write_all(&v.to_le_bytes())?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Text format
    // ------------------------------------------------------------------------

    fn read_text(tokens: &mut Tokens<'_>, net: usize) -> Result<Option<Self>, WeightsError> {
        if tokens.at_end() {
            return Ok(None);
        }

        let inputs: i64 = tokens.parse(net)?;
        let hidden: i64 = tokens.parse(net)?;
        let outputs: i64 = tokens.parse(net)?;
        let trained: i64 = tokens.parse(net)?;
        check_dimensions(net, inputs, hidden, outputs)?;
        let (inputs, hidden, outputs) = (inputs as usize, hidden as usize, outputs as usize);

        let beta_hidden: f32 = tokens.parse(net)?;
        let beta_output: f32 = tokens.parse(net)?;
        let hidden_weights = tokens.parse_n(inputs * hidden, net)?;
        let output_weights = tokens.parse_n(outputs * hidden, net)?;
        let hidden_thresholds = tokens.parse_n(hidden, net)?;
        let output_thresholds = tokens.parse_n(outputs, net)?;

        Self::from_params_indexed(
            NetParams {
                inputs,
                hidden,
                outputs,
                trained: trained != 0,
                beta_hidden,
                beta_output,
                hidden_weights,
                output_weights,
                hidden_thresholds,
                output_thresholds,
            },
            net,
        )
        .map(Some)
    }
}

/// Fill `buf`, or return `Ok(false)` if the reader is already at EOF.
fn read_or_eof<R: Read>(reader: &mut R, buf: &mut [u8], net: usize) -> Result<bool, WeightsError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(WeightsError::Truncated { net }),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

fn read_exact_or_truncated<R: Read>(reader: &mut R, buf: &mut [u8], net: usize) -> Result<(), WeightsError> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            WeightsError::Truncated { net }
        } else {
            WeightsError::Io(e)
        }
    })
}

fn read_i32<R: Read>(reader: &mut R, net: usize) -> Result<i32, WeightsError> {
    let mut buf = [0u8; 4];
    read_exact_or_truncated(reader, &mut buf, net)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_f32<R: Read>(reader: &mut R, net: usize) -> Result<f32, WeightsError> {
    let mut buf = [0u8; 4];
    read_exact_or_truncated(reader, &mut buf, net)?;
    Ok(f32::from_le_bytes(buf))
}

fn read_f32s<R: Read>(reader: &mut R, n: usize, net: usize) -> Result<Vec<f32>, WeightsError> {
    let mut bytes = vec![0u8; n * 4];
    read_exact_or_truncated(reader, &mut bytes, net)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Whitespace-separated tokens with their line numbers.
struct Tokens<'a> {
    iter: std::iter::Peekable<Box<dyn Iterator<Item = (usize, &'a str)> + 'a>>,
}

impl<'a> Tokens<'a> {
    fn new(text: &'a str) -> Self {
        let iter: Box<dyn Iterator<Item = (usize, &'a str)> + 'a> = Box::new(
            text.lines()
                .enumerate()
                .flat_map(|(n, line)| line.split_whitespace().map(move |tok| (n + 1, tok))),
        );
        Self {
            iter: iter.peekable(),
        }
    }

    fn at_end(&mut self) -> bool {
        self.iter.peek().is_none()
    }

    fn next(&mut self, net: usize) -> Result<(usize, &'a str), WeightsError> {
        self.iter.next().ok_or(WeightsError::Truncated { net })
    }

    fn parse<T: std::str::FromStr>(&mut self, net: usize) -> Result<T, WeightsError> {
        let (line, token) = self.next(net)?;
        token.parse().map_err(|_| WeightsError::Parse {
            line,
            token: token.to_string(),
        })
    }

    fn parse_n(&mut self, n: usize, net: usize) -> Result<Vec<f32>, WeightsError> {
        let mut values = Vec::with_capacity(n);
        for _ in 0..n {
            values.push(self.parse(net)?);
        }
        Ok(values)
    }
}

// ============================================================================
// File-level loading and writing
// ============================================================================

/// Read every net from a binary weights stream.
pub fn read_binary_nets<R: Read>(reader: &mut R) -> Result<Vec<NeuralNet>, WeightsError> {
    let magic = read_f32(reader, 0)?;
    if magic != WEIGHTS_MAGIC {
        return Err(WeightsError::BadMagic { found: magic });
    }
    let version = read_f32(reader, 0)?;
    if version != WEIGHTS_VERSION {
        return Err(WeightsError::BadVersion {
            found: version.to_string(),
        });
    }

    let mut nets = Vec::new();
    while let Some(net) = NeuralNet::read_binary(reader, nets.len())? {
        nets.push(net);
    }
    Ok(nets)
}

/// Parse every net from text weights.
pub fn read_text_nets(text: &str) -> Result<Vec<NeuralNet>, WeightsError> {
    let mut tokens = Tokens::new(text);

    let (line, header) = tokens.next(0)?;
    if header != TEXT_HEADER {
        return Err(WeightsError::Parse {
            line,
            token: header.to_string(),
        });
    }
    let (_, version) = tokens.next(0)?;
    if version.parse::<f32>().ok() != Some(WEIGHTS_VERSION) {
        return Err(WeightsError::BadVersion {
            found: version.to_string(),
        });
    }

    let mut nets = Vec::new();
    while let Some(net) = NeuralNet::read_text(&mut tokens, nets.len())? {
        nets.push(net);
    }
    Ok(nets)
}

/// Load nets from a file, detecting text or binary format from its header.
pub fn load_nets<P: AsRef<Path>>(path: P) -> Result<Vec<NeuralNet>, WeightsError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let is_text = reader.fill_buf()?.starts_with(TEXT_HEADER.as_bytes());
    if is_text {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        read_text_nets(&text)
    } else {
        read_binary_nets(&mut reader)
    }
}

/// Write nets in the binary format.
pub fn write_binary_nets<'a, W, I>(writer: &mut W, nets: I) -> io::Result<()>
where
    W: Write,
    I: IntoIterator<Item = &'a NeuralNet>,
{
    writer.write_all(&WEIGHTS_MAGIC.to_le_bytes())?;
    writer.write_all(&WEIGHTS_VERSION.to_le_bytes())?;
    for net in nets {
        net.write_binary(writer)?;
    }
    Ok(())
}

/// Write nets in the binary format to `path`.
pub fn save_binary_nets<'a, P, I>(path: P, nets: I) -> io::Result<()>
where
    P: AsRef<Path>,
    I: IntoIterator<Item = &'a NeuralNet>,
{
    let mut writer = BufWriter::new(File::create(path)?);
    write_binary_nets(&mut writer, nets)?;
    writer.flush()
}
