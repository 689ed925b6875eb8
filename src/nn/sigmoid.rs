//! Table-driven logistic activation.
//!
//! `sigmoid(x) = 1 / (1 + e^x)`. The exponential is read from a table sampled
//! every 0.1 and linearly interpolated between samples, so the approximation is
//! continuous and monotone. Inputs with magnitude of 10 or more are clamped.

use once_cell::sync::Lazy;

/// Largest magnitude handled before clamping.
pub const SIGMOID_CLAMP: f32 = 10.0;

/// Samples per unit of `x`.
pub const TABLE_STEP: f32 = 10.0;

/// Number of table entries (`0..=100` plus one for the interpolation edge).
pub const TABLE_LEN: usize = 102;

/// `EXP_TABLE[i] = exp(i / 10)`.
pub static EXP_TABLE: Lazy<[f32; TABLE_LEN]> = Lazy::new(|| {
    let mut table = [0.0f32; TABLE_LEN];
    for (i, slot) in table.iter_mut().enumerate() {
        *slot = (i as f64 / f64::from(TABLE_STEP)).exp() as f32;
    }
    table
});

/// `EXP_SLOPE[i] = EXP_TABLE[i + 1] - EXP_TABLE[i]`; the last entry is unused.
pub static EXP_SLOPE: Lazy<[f32; TABLE_LEN]> = Lazy::new(|| {
    let exp = &*EXP_TABLE;
    let mut slope = [0.0f32; TABLE_LEN];
    for i in 0..TABLE_LEN - 1 {
        slope[i] = exp[i + 1] - exp[i];
    }
    slope
});

/// `1 / (1 + e^a)` for `a >= 0`.
#[inline]
#[must_use]
pub fn sigmoid_positive(a: f32) -> f32 {
    let a = a.min(SIGMOID_CLAMP);
    let x1 = a * TABLE_STEP;
    let i = x1 as usize;
    let frac = x1 - i as f32;
    let ex = EXP_TABLE[i] + EXP_SLOPE[i] * frac;
    1.0 / (1.0 + ex)
}

/// Approximate `1 / (1 + e^x)`.
#[inline]
#[must_use]
pub fn sigmoid(x: f32) -> f32 {
    let c = sigmoid_positive(x.abs());
    if x < 0.0 {
        1.0 - c
    } else {
        c
    }
}
