//! Vectorized building blocks for the forward pass.
//!
//! Provides the row operations the forward pass is made of:
//! - Hidden accumulation (add / subtract / scaled add of a weight row)
//! - Table-driven sigmoid over a whole layer
//! - Dot product for the output layer
//!
//! Supports:
//! - `x86_64`: AVX2 + FMA (8 lanes), selected at runtime
//! - aarch64: NEON (4 lanes)
//! - Fallback: Scalar operations
//!
//! Every backend agrees with the scalar one within float rounding.

use once_cell::sync::Lazy;

use super::sigmoid::sigmoid;

/// Row operations used by the forward pass. Implemented once per backend.
pub(crate) trait Kernel {
    /// `acc[i] += row[i]`
    fn add_row(acc: &mut [f32], row: &[f32]);
    /// `acc[i] -= row[i]`
    fn sub_row(acc: &mut [f32], row: &[f32]);
    /// `acc[i] += row[i] * scale`
    fn add_scaled_row(acc: &mut [f32], row: &[f32], scale: f32);
    /// `values[i] = sigmoid(-beta * values[i])`
    fn activate(values: &mut [f32], beta: f32);
    /// `sum(a[i] * b[i])`
    fn dot(a: &[f32], b: &[f32]) -> f32;
}

/// Kernel implementation chosen for a network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Backend {
    Scalar,
    #[cfg(target_arch = "x86_64")]
    Avx2,
    #[cfg(target_arch = "aarch64")]
    Neon,
}

static DETECTED: Lazy<Backend> = Lazy::new(Backend::probe);

impl Backend {
    /// Best backend the running CPU supports. Probed once per process.
    #[must_use]
    pub fn detect() -> Self {
        *DETECTED
    }

    fn probe() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
                return Backend::Avx2;
            }
        }

        #[cfg(target_arch = "aarch64")]
        {
            return Backend::Neon;
        }

        #[allow(unreachable_code)]
        Backend::Scalar
    }

    /// Whether this backend can run on the current CPU.
    #[must_use]
    pub fn is_supported(self) -> bool {
        match self {
            Backend::Scalar => true,
            #[cfg(target_arch = "x86_64")]
            Backend::Avx2 => DETECTED.eq(&Backend::Avx2),
            #[cfg(target_arch = "aarch64")]
            Backend::Neon => true,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Backend::Scalar => "scalar",
            #[cfg(target_arch = "x86_64")]
            Backend::Avx2 => "avx2",
            #[cfg(target_arch = "aarch64")]
            Backend::Neon => "neon",
        }
    }
}

impl Default for Backend {
    fn default() -> Self {
        Self::detect()
    }
}

// ============================================================================
// Scalar fallback implementation
// ============================================================================

pub(crate) struct ScalarKernel;

impl Kernel for ScalarKernel {
    #[inline]
    fn add_row(acc: &mut [f32], row: &[f32]) {
        debug_assert_eq!(acc.len(), row.len());
        for (a, &w) in acc.iter_mut().zip(row) {
            *a += w;
        }
    }

    #[inline]
    fn sub_row(acc: &mut [f32], row: &[f32]) {
        debug_assert_eq!(acc.len(), row.len());
        for (a, &w) in acc.iter_mut().zip(row) {
            *a -= w;
        }
    }

    #[inline]
    fn add_scaled_row(acc: &mut [f32], row: &[f32], scale: f32) {
        debug_assert_eq!(acc.len(), row.len());
        for (a, &w) in acc.iter_mut().zip(row) {
            *a += w * scale;
        }
    }

    #[inline]
    fn activate(values: &mut [f32], beta: f32) {
        for v in values.iter_mut() {
            *v = sigmoid(-beta * *v);
        }
    }

    #[inline]
    fn dot(a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len());
        a.iter().zip(b).map(|(&x, &y)| x * y).sum()
    }
}

// ============================================================================
// AVX2 implementation (x86_64 only)
// ============================================================================

/// Only reachable through `Backend::Avx2`, which `Backend::probe` returns
/// after confirming `avx2` and `fma` at runtime.
#[cfg(target_arch = "x86_64")]
pub(crate) struct Avx2Kernel;

#[cfg(target_arch = "x86_64")]
impl Kernel for Avx2Kernel {
    #[inline]
    fn add_row(acc: &mut [f32], row: &[f32]) {
        unsafe { avx2::add_row(acc, row) }
    }

    #[inline]
    fn sub_row(acc: &mut [f32], row: &[f32]) {
        unsafe { avx2::sub_row(acc, row) }
    }

    #[inline]
    fn add_scaled_row(acc: &mut [f32], row: &[f32], scale: f32) {
        unsafe { avx2::add_scaled_row(acc, row, scale) }
    }

    #[inline]
    fn activate(values: &mut [f32], beta: f32) {
        unsafe { avx2::activate(values, beta) }
    }

    #[inline]
    fn dot(a: &[f32], b: &[f32]) -> f32 {
        unsafe { avx2::dot(a, b) }
    }
}

#[cfg(target_arch = "x86_64")]
mod avx2 {
    use std::arch::x86_64::*;

    use super::super::sigmoid::{EXP_SLOPE, EXP_TABLE, SIGMOID_CLAMP, TABLE_STEP};
    use super::sigmoid;

    const LANES: usize = 8;

    #[target_feature(enable = "avx2,fma")]
    pub unsafe fn add_row(acc: &mut [f32], row: &[f32]) {
        assert_eq!(acc.len(), row.len());
        let n = acc.len();
        let body = n - n % LANES;
        let acc_ptr = acc.as_mut_ptr();
        let row_ptr = row.as_ptr();

        for i in (0..body).step_by(LANES) {
            let a = _mm256_loadu_ps(acc_ptr.add(i));
            let w = _mm256_loadu_ps(row_ptr.add(i));
            _mm256_storeu_ps(acc_ptr.add(i), _mm256_add_ps(a, w));
        }
        for i in body..n {
            *acc_ptr.add(i) += *row_ptr.add(i);
        }
    }

    #[target_feature(enable = "avx2,fma")]
    pub unsafe fn sub_row(acc: &mut [f32], row: &[f32]) {
        assert_eq!(acc.len(), row.len());
        let n = acc.len();
        let body = n - n % LANES;
        let acc_ptr = acc.as_mut_ptr();
        let row_ptr = row.as_ptr();

        for i in (0..body).step_by(LANES) {
            let a = _mm256_loadu_ps(acc_ptr.add(i));
            let w = _mm256_loadu_ps(row_ptr.add(i));
            _mm256_storeu_ps(acc_ptr.add(i), _mm256_sub_ps(a, w));
        }
        for i in body..n {
            *acc_ptr.add(i) -= *row_ptr.add(i);
        }
    }

    #[target_feature(enable = "avx2,fma")]
    pub unsafe fn add_scaled_row(acc: &mut [f32], row: &[f32], scale: f32) {
        assert_eq!(acc.len(), row.len());
        let n = acc.len();
        let body = n - n % LANES;
        let acc_ptr = acc.as_mut_ptr();
        let row_ptr = row.as_ptr();
        let s = _mm256_set1_ps(scale);

        for i in (0..body).step_by(LANES) {
            let a = _mm256_loadu_ps(acc_ptr.add(i));
            let w = _mm256_loadu_ps(row_ptr.add(i));
            _mm256_storeu_ps(acc_ptr.add(i), _mm256_fmadd_ps(w, s, a));
        }
        for i in body..n {
            *acc_ptr.add(i) += *row_ptr.add(i) * scale;
        }
    }

    #[target_feature(enable = "avx2,fma")]
    pub unsafe fn activate(values: &mut [f32], beta: f32) {
        let n = values.len();
        let body = n - n % LANES;
        let ptr = values.as_mut_ptr();

        let exp = EXP_TABLE.as_ptr();
        let slope = EXP_SLOPE.as_ptr();
        let beta_v = _mm256_set1_ps(beta);
        let abs_mask = _mm256_castsi256_ps(_mm256_set1_epi32(0x7FFF_FFFF));
        let clamp = _mm256_set1_ps(SIGMOID_CLAMP);
        let step = _mm256_set1_ps(TABLE_STEP);
        let one = _mm256_set1_ps(1.0);
        let zero = _mm256_setzero_ps();

        for i in (0..body).step_by(LANES) {
            // y = beta * v, result is sigmoid(-y)
            let y = _mm256_mul_ps(_mm256_loadu_ps(ptr.add(i)), beta_v);
            // min_ps returns the second operand for NaN lanes, keeping the gather in bounds
            let a = _mm256_min_ps(_mm256_and_ps(y, abs_mask), clamp);
            let x1 = _mm256_mul_ps(a, step);
            let idx = _mm256_cvttps_epi32(x1);
            let frac = _mm256_sub_ps(x1, _mm256_cvtepi32_ps(idx));
            let e = _mm256_i32gather_ps::<4>(exp, idx);
            let s = _mm256_i32gather_ps::<4>(slope, idx);
            let ex = _mm256_fmadd_ps(s, frac, e);
            let c = _mm256_div_ps(one, _mm256_add_ps(one, ex));
            let positive = _mm256_cmp_ps::<_CMP_GT_OQ>(y, zero);
            let r = _mm256_blendv_ps(c, _mm256_sub_ps(one, c), positive);
            _mm256_storeu_ps(ptr.add(i), r);
        }
        for i in body..n {
            let v = ptr.add(i);
            *v = sigmoid(-beta * *v);
        }
    }

    #[target_feature(enable = "avx2,fma")]
    pub unsafe fn dot(a: &[f32], b: &[f32]) -> f32 {
        assert_eq!(a.len(), b.len());
        let n = a.len();
        let body = n - n % LANES;
        let a_ptr = a.as_ptr();
        let b_ptr = b.as_ptr();

        let mut sum = _mm256_setzero_ps();
        for i in (0..body).step_by(LANES) {
            let x = _mm256_loadu_ps(a_ptr.add(i));
            let y = _mm256_loadu_ps(b_ptr.add(i));
            sum = _mm256_fmadd_ps(x, y, sum);
        }

        // Horizontal sum
        let lo = _mm256_castps256_ps128(sum);
        let hi = _mm256_extractf128_ps::<1>(sum);
        let quad = _mm_add_ps(lo, hi);
        let dual = _mm_add_ps(quad, _mm_movehl_ps(quad, quad));
        let single = _mm_add_ss(dual, _mm_movehdup_ps(dual));
        let mut total = _mm_cvtss_f32(single);

        for i in body..n {
            total += *a_ptr.add(i) * *b_ptr.add(i);
        }
        total
    }
}

// ============================================================================
// NEON implementation (aarch64 - Apple Silicon, ARM servers)
// ============================================================================

#[cfg(target_arch = "aarch64")]
pub(crate) struct NeonKernel;

#[cfg(target_arch = "aarch64")]
impl Kernel for NeonKernel {
    #[inline]
    fn add_row(acc: &mut [f32], row: &[f32]) {
        unsafe { neon::add_row(acc, row) }
    }

    #[inline]
    fn sub_row(acc: &mut [f32], row: &[f32]) {
        unsafe { neon::sub_row(acc, row) }
    }

    #[inline]
    fn add_scaled_row(acc: &mut [f32], row: &[f32], scale: f32) {
        unsafe { neon::add_scaled_row(acc, row, scale) }
    }

    #[inline]
    fn activate(values: &mut [f32], beta: f32) {
        unsafe { neon::activate(values, beta) }
    }

    #[inline]
    fn dot(a: &[f32], b: &[f32]) -> f32 {
        unsafe { neon::dot(a, b) }
    }
}

#[cfg(target_arch = "aarch64")]
mod neon {
    use std::arch::aarch64::*;

    use super::super::sigmoid::{EXP_SLOPE, EXP_TABLE, SIGMOID_CLAMP, TABLE_STEP};
    use super::sigmoid;

    const LANES: usize = 4;

    pub unsafe fn add_row(acc: &mut [f32], row: &[f32]) {
        assert_eq!(acc.len(), row.len());
        let n = acc.len();
        let body = n - n % LANES;
        let acc_ptr = acc.as_mut_ptr();
        let row_ptr = row.as_ptr();

        for i in (0..body).step_by(LANES) {
            let a = vld1q_f32(acc_ptr.add(i));
            let w = vld1q_f32(row_ptr.add(i));
            vst1q_f32(acc_ptr.add(i), vaddq_f32(a, w));
        }
        for i in body..n {
            *acc_ptr.add(i) += *row_ptr.add(i);
        }
    }

    pub unsafe fn sub_row(acc: &mut [f32], row: &[f32]) {
        assert_eq!(acc.len(), row.len());
        let n = acc.len();
        let body = n - n % LANES;
        let acc_ptr = acc.as_mut_ptr();
        let row_ptr = row.as_ptr();

        for i in (0..body).step_by(LANES) {
            let a = vld1q_f32(acc_ptr.add(i));
            let w = vld1q_f32(row_ptr.add(i));
            vst1q_f32(acc_ptr.add(i), vsubq_f32(a, w));
        }
        for i in body..n {
            *acc_ptr.add(i) -= *row_ptr.add(i);
        }
    }

    pub unsafe fn add_scaled_row(acc: &mut [f32], row: &[f32], scale: f32) {
        assert_eq!(acc.len(), row.len());
        let n = acc.len();
        let body = n - n % LANES;
        let acc_ptr = acc.as_mut_ptr();
        let row_ptr = row.as_ptr();
        let s = vdupq_n_f32(scale);

        for i in (0..body).step_by(LANES) {
            let a = vld1q_f32(acc_ptr.add(i));
            let w = vld1q_f32(row_ptr.add(i));
            vst1q_f32(acc_ptr.add(i), vfmaq_f32(a, w, s));
        }
        for i in body..n {
            *acc_ptr.add(i) += *row_ptr.add(i) * scale;
        }
    }

    pub unsafe fn activate(values: &mut [f32], beta: f32) {
        let n = values.len();
        let body = n - n % LANES;
        let ptr = values.as_mut_ptr();

        let exp = &*EXP_TABLE;
        let slope = &*EXP_SLOPE;
        let beta_v = vdupq_n_f32(beta);
        let clamp = vdupq_n_f32(SIGMOID_CLAMP);
        let step = vdupq_n_f32(TABLE_STEP);
        let one = vdupq_n_f32(1.0);
        let zero = vdupq_n_f32(0.0);

        for i in (0..body).step_by(LANES) {
            let y = vmulq_f32(vld1q_f32(ptr.add(i)), beta_v);
            // minnm keeps NaN lanes at the clamp value
            let a = vminnmq_f32(vabsq_f32(y), clamp);
            let x1 = vmulq_f32(a, step);
            let idx_v = vcvtq_u32_f32(x1);
            let frac = vsubq_f32(x1, vcvtq_f32_u32(idx_v));

            // No gather on NEON: look the lanes up one by one
            let mut idx = [0u32; LANES];
            vst1q_u32(idx.as_mut_ptr(), idx_v);
            let e_lanes = idx.map(|k| exp[k as usize]);
            let s_lanes = idx.map(|k| slope[k as usize]);
            let e = vld1q_f32(e_lanes.as_ptr());
            let s = vld1q_f32(s_lanes.as_ptr());

            let ex = vfmaq_f32(e, s, frac);
            let c = vdivq_f32(one, vaddq_f32(one, ex));
            let positive = vcgtq_f32(y, zero);
            let r = vbslq_f32(positive, vsubq_f32(one, c), c);
            vst1q_f32(ptr.add(i), r);
        }
        for i in body..n {
            let v = ptr.add(i);
            *v = sigmoid(-beta * *v);
        }
    }

    pub unsafe fn dot(a: &[f32], b: &[f32]) -> f32 {
        assert_eq!(a.len(), b.len());
        let n = a.len();
        let body = n - n % LANES;
        let a_ptr = a.as_ptr();
        let b_ptr = b.as_ptr();

        let mut sum = vdupq_n_f32(0.0);
        for i in (0..body).step_by(LANES) {
            sum = vfmaq_f32(sum, vld1q_f32(a_ptr.add(i)), vld1q_f32(b_ptr.add(i)));
        }
        let mut total = vaddvq_f32(sum);
        for i in body..n {
            total += *a_ptr.add(i) * *b_ptr.add(i);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn random_vec(rng: &mut StdRng, len: usize, range: f32) -> Vec<f32> {
        (0..len).map(|_| rng.gen_range(-range..range)).collect()
    }

    /// Run `f` with every kernel the CPU supports.
    fn for_each_kernel(mut f: impl FnMut(&str, &dyn Fn(&mut [f32], &[f32]), &dyn Fn(&mut [f32], f32), &dyn Fn(&[f32], &[f32]) -> f32)) {
        f("scalar", &ScalarKernel::add_row, &ScalarKernel::activate, &ScalarKernel::dot);

        #[cfg(target_arch = "x86_64")]
        if Backend::Avx2.is_supported() {
            f("avx2", &Avx2Kernel::add_row, &Avx2Kernel::activate, &Avx2Kernel::dot);
        }

        #[cfg(target_arch = "aarch64")]
        f("neon", &NeonKernel::add_row, &NeonKernel::activate, &NeonKernel::dot);
    }

    #[test]
    fn test_scalar_add_and_sub_row() {
        let mut acc = vec![1.0f32; 13];
        let row = vec![0.5f32; 13];

        ScalarKernel::add_row(&mut acc, &row);
        assert!(acc.iter().all(|&v| v == 1.5));

        ScalarKernel::sub_row(&mut acc, &row);
        assert!(acc.iter().all(|&v| v == 1.0));

        ScalarKernel::add_scaled_row(&mut acc, &row, -2.0);
        assert!(acc.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_add_row_handles_odd_lengths() {
        for_each_kernel(|name, add, _, _| {
            for len in [1usize, 3, 7, 8, 9, 17, 128] {
                let mut acc = vec![2.0f32; len];
                let row: Vec<f32> = (0..len).map(|i| i as f32).collect();
                add(&mut acc, &row);
                for (i, &v) in acc.iter().enumerate() {
                    assert_eq!(v, 2.0 + i as f32, "{name} len {len} index {i}");
                }
            }
        });
    }

    #[test]
    fn test_activate_matches_scalar() {
        let mut rng = StdRng::seed_from_u64(7);
        let base = random_vec(&mut rng, 131, 25.0);

        let mut expected = base.clone();
        ScalarKernel::activate(&mut expected, 0.7);

        for_each_kernel(|name, _, activate, _| {
            let mut got = base.clone();
            activate(&mut got, 0.7);
            for (i, (&g, &e)) in got.iter().zip(&expected).enumerate() {
                assert!((g - e).abs() < 1e-5, "{name} lane {i}: {g} vs {e}");
            }
        });
    }

    #[test]
    fn test_activate_tolerates_nan_and_infinity() {
        for_each_kernel(|name, _, activate, _| {
            let mut values = vec![f32::NAN, f32::INFINITY, f32::NEG_INFINITY, 0.0, 1.0, 2.0, 3.0, 4.0];
            activate(&mut values, 1.0);
            assert!(values[0].is_finite(), "{name}: nan");
            assert!(values[1] > 1.0 - 1e-4, "{name}: +inf");
            assert!(values[2] < 1e-4, "{name}: -inf");
            assert!((values[3] - 0.5).abs() < 1e-6, "{name}: zero");
        });
    }

    #[test]
    fn test_dot_matches_scalar() {
        let mut rng = StdRng::seed_from_u64(11);
        for len in [5usize, 64, 128, 133] {
            let a = random_vec(&mut rng, len, 1.0);
            let b = random_vec(&mut rng, len, 1.0);
            let expected = ScalarKernel::dot(&a, &b);

            for_each_kernel(|name, _, _, dot| {
                let got = dot(&a, &b);
                assert!((got - expected).abs() < 1e-4, "{name} len {len}: {got} vs {expected}");
            });
        }
    }

    #[test]
    fn test_detected_backend_is_supported() {
        let backend = Backend::detect();
        assert!(backend.is_supported());
        assert!(!backend.name().is_empty());
        assert!(Backend::Scalar.is_supported());
    }
}
