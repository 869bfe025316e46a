//! SIMD-optimized distance kernels with runtime CPU dispatch
//!
//! Cosine distance (`1 - dot` over pre-normalized inputs) and squared L2
//! distance, each in up to three widths:
//!
//! | ISA          | Width            | Gate                          |
//! |--------------|------------------|-------------------------------|
//! | AVX-512F     | 512-bit (16×f32) | `avx512` feature + CPU probe  |
//! | AVX2+FMA     | 256-bit (8×f32)  | CPU probe                     |
//! | NEON         | 128-bit (4×f32)  | always on aarch64             |
//! | scalar       | 1×f32            | fallback                      |
//!
//! Feature detection runs once; the winning pair of function pointers is
//! cached in a process-wide [`DistanceKernel`]. `VDB_SIMD` forces a specific
//! path for testing (`auto | avx512 | avx2 | scalar`).
//!
//! Accumulation is f32 throughout. Different widths reduce in different
//! orders, so results agree across paths only to ~1e-5 relative error.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::format::Metric;

/// Signature shared by all kernel entry points.
pub type DistanceFn = fn(&[f32], &[f32]) -> f32;

/// Which implementation a kernel routes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimdLevel {
    Avx512,
    Avx2,
    Neon,
    Scalar,
}

impl std::fmt::Display for SimdLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimdLevel::Avx512 => write!(f, "avx512"),
            SimdLevel::Avx2 => write!(f, "avx2"),
            SimdLevel::Neon => write!(f, "neon"),
            SimdLevel::Scalar => write!(f, "scalar"),
        }
    }
}

// ============================================================================
// Scalar fallback
// ============================================================================

#[inline(always)]
fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline(always)]
fn l2_squared_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

// ============================================================================
// x86_64 AVX2+FMA (8 lanes)
// ============================================================================

/// AVX2+FMA dot product: 8 floats per iteration, scalar tail.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn dot_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let n = a.len();
    let chunks = n / 8;

    let mut acc = _mm256_setzero_ps();
    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();

    for i in 0..chunks {
        let va = _mm256_loadu_ps(a_ptr.add(i * 8));
        let vb = _mm256_loadu_ps(b_ptr.add(i * 8));
        acc = _mm256_fmadd_ps(va, vb, acc);
    }

    // Horizontal sum of 8 lanes
    let hi = _mm256_extractf128_ps(acc, 1);
    let lo = _mm256_castps256_ps128(acc);
    let sum128 = _mm_add_ps(lo, hi);
    let shuf = _mm_movehdup_ps(sum128);
    let sums = _mm_add_ps(sum128, shuf);
    let shuf2 = _mm_movehl_ps(sums, sums);
    let mut sum = _mm_cvtss_f32(_mm_add_ss(sums, shuf2));

    for i in chunks * 8..n {
        sum += a[i] * b[i];
    }
    sum
}

/// AVX2+FMA squared L2 distance: 8 floats per iteration, scalar tail.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn l2_squared_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let n = a.len();
    let chunks = n / 8;

    let mut acc = _mm256_setzero_ps();
    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();

    for i in 0..chunks {
        let va = _mm256_loadu_ps(a_ptr.add(i * 8));
        let vb = _mm256_loadu_ps(b_ptr.add(i * 8));
        let diff = _mm256_sub_ps(va, vb);
        acc = _mm256_fmadd_ps(diff, diff, acc);
    }

    let hi = _mm256_extractf128_ps(acc, 1);
    let lo = _mm256_castps256_ps128(acc);
    let sum128 = _mm_add_ps(lo, hi);
    let shuf = _mm_movehdup_ps(sum128);
    let sums = _mm_add_ps(sum128, shuf);
    let shuf2 = _mm_movehl_ps(sums, sums);
    let mut sum = _mm_cvtss_f32(_mm_add_ss(sums, shuf2));

    for i in chunks * 8..n {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

#[cfg(target_arch = "x86_64")]
fn dot_avx2_entry(a: &[f32], b: &[f32]) -> f32 {
    // Only reachable through a kernel built after the CPU probe succeeded.
    unsafe { dot_avx2(a, b) }
}

#[cfg(target_arch = "x86_64")]
fn l2_squared_avx2_entry(a: &[f32], b: &[f32]) -> f32 {
    unsafe { l2_squared_avx2(a, b) }
}

// ============================================================================
// x86_64 AVX-512F (16 lanes)
// ============================================================================

/// AVX-512 dot product: 16 floats per iteration, scalar tail.
#[cfg(all(target_arch = "x86_64", feature = "avx512"))]
#[target_feature(enable = "avx512f")]
unsafe fn dot_avx512(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let n = a.len();
    let chunks = n / 16;

    let mut acc = _mm512_setzero_ps();
    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();

    for i in 0..chunks {
        let va = _mm512_loadu_ps(a_ptr.add(i * 16));
        let vb = _mm512_loadu_ps(b_ptr.add(i * 16));
        acc = _mm512_fmadd_ps(va, vb, acc);
    }

    let mut sum = _mm512_reduce_add_ps(acc);

    for i in chunks * 16..n {
        sum += a[i] * b[i];
    }
    sum
}

/// AVX-512 squared L2 distance: 16 floats per iteration, scalar tail.
#[cfg(all(target_arch = "x86_64", feature = "avx512"))]
#[target_feature(enable = "avx512f")]
unsafe fn l2_squared_avx512(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let n = a.len();
    let chunks = n / 16;

    let mut acc = _mm512_setzero_ps();
    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();

    for i in 0..chunks {
        let va = _mm512_loadu_ps(a_ptr.add(i * 16));
        let vb = _mm512_loadu_ps(b_ptr.add(i * 16));
        let diff = _mm512_sub_ps(va, vb);
        acc = _mm512_fmadd_ps(diff, diff, acc);
    }

    let mut sum = _mm512_reduce_add_ps(acc);

    for i in chunks * 16..n {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

#[cfg(all(target_arch = "x86_64", feature = "avx512"))]
fn dot_avx512_entry(a: &[f32], b: &[f32]) -> f32 {
    unsafe { dot_avx512(a, b) }
}

#[cfg(all(target_arch = "x86_64", feature = "avx512"))]
fn l2_squared_avx512_entry(a: &[f32], b: &[f32]) -> f32 {
    unsafe { l2_squared_avx512(a, b) }
}

// ============================================================================
// aarch64 NEON (4 lanes)
// ============================================================================

#[cfg(target_arch = "aarch64")]
fn dot_neon_entry(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let n = a.len();
    let chunks = n / 4;

    // NEON is baseline on aarch64.
    unsafe {
        let mut acc = vdupq_n_f32(0.0);
        let a_ptr = a.as_ptr();
        let b_ptr = b.as_ptr();

        for i in 0..chunks {
            let va = vld1q_f32(a_ptr.add(i * 4));
            let vb = vld1q_f32(b_ptr.add(i * 4));
            acc = vfmaq_f32(acc, va, vb);
        }

        let mut sum = vaddvq_f32(acc);
        for i in chunks * 4..n {
            sum += a[i] * b[i];
        }
        sum
    }
}

#[cfg(target_arch = "aarch64")]
fn l2_squared_neon_entry(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let n = a.len();
    let chunks = n / 4;

    unsafe {
        let mut acc = vdupq_n_f32(0.0);
        let a_ptr = a.as_ptr();
        let b_ptr = b.as_ptr();

        for i in 0..chunks {
            let va = vld1q_f32(a_ptr.add(i * 4));
            let vb = vld1q_f32(b_ptr.add(i * 4));
            let diff = vsubq_f32(va, vb);
            acc = vfmaq_f32(acc, diff, diff);
        }

        let mut sum = vaddvq_f32(acc);
        for i in chunks * 4..n {
            let d = a[i] - b[i];
            sum += d * d;
        }
        sum
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Resolved distance kernel: one dot-product and one squared-L2 entry point.
///
/// The process-wide instance is built once (see [`kernel`]) and called
/// through indirection thereafter; the call overhead is noise next to the
/// memory traffic of the vectors themselves.
#[derive(Clone, Copy)]
pub struct DistanceKernel {
    pub level: SimdLevel,
    dot: DistanceFn,
    l2_squared: DistanceFn,
}

impl DistanceKernel {
    /// Build a kernel for a specific level, falling back to the best
    /// available path when the request is unsupported on this CPU.
    pub fn for_level(requested: SimdLevel) -> Self {
        let level = clamp_to_available(requested);
        match level {
            #[cfg(all(target_arch = "x86_64", feature = "avx512"))]
            SimdLevel::Avx512 => Self {
                level,
                dot: dot_avx512_entry,
                l2_squared: l2_squared_avx512_entry,
            },
            #[cfg(target_arch = "x86_64")]
            SimdLevel::Avx2 => Self {
                level,
                dot: dot_avx2_entry,
                l2_squared: l2_squared_avx2_entry,
            },
            #[cfg(target_arch = "aarch64")]
            SimdLevel::Neon => Self {
                level,
                dot: dot_neon_entry,
                l2_squared: l2_squared_neon_entry,
            },
            _ => Self {
                level: SimdLevel::Scalar,
                dot: dot_scalar,
                l2_squared: l2_squared_scalar,
            },
        }
    }

    /// Dot product of two equal-length vectors.
    #[inline(always)]
    pub fn dot(&self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len(), "vector length mismatch");
        (self.dot)(a, b)
    }

    /// Squared L2 distance between two equal-length vectors.
    #[inline(always)]
    pub fn l2_squared(&self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len(), "vector length mismatch");
        (self.l2_squared)(a, b)
    }

    /// Metric distance: smaller is more similar.
    ///
    /// Cosine assumes both inputs are L2-normalized; callers enforce that
    /// before storage and before querying.
    #[inline(always)]
    pub fn distance(&self, metric: Metric, a: &[f32], b: &[f32]) -> f32 {
        match metric {
            Metric::Cosine => 1.0 - self.dot(a, b),
            Metric::L2 => self.l2_squared(a, b),
        }
    }
}

/// Detect the widest path this CPU supports.
pub fn detect() -> SimdLevel {
    #[cfg(target_arch = "x86_64")]
    {
        #[cfg(feature = "avx512")]
        if is_x86_feature_detected!("avx512f") {
            return SimdLevel::Avx512;
        }
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return SimdLevel::Avx2;
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        return SimdLevel::Neon;
    }

    #[allow(unreachable_code)]
    SimdLevel::Scalar
}

fn clamp_to_available(requested: SimdLevel) -> SimdLevel {
    match requested {
        SimdLevel::Avx512 => {
            #[cfg(all(target_arch = "x86_64", feature = "avx512"))]
            if is_x86_feature_detected!("avx512f") {
                return SimdLevel::Avx512;
            }
            clamp_to_available(SimdLevel::Avx2)
        }
        SimdLevel::Avx2 => {
            #[cfg(target_arch = "x86_64")]
            if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
                return SimdLevel::Avx2;
            }
            clamp_to_available(SimdLevel::Neon)
        }
        SimdLevel::Neon => {
            #[cfg(target_arch = "aarch64")]
            return SimdLevel::Neon;
            #[allow(unreachable_code)]
            SimdLevel::Scalar
        }
        SimdLevel::Scalar => SimdLevel::Scalar,
    }
}

/// Parse a `VDB_SIMD`-style override. `auto` (or empty) means "detect".
pub fn parse_override(value: &str) -> Option<SimdLevel> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "auto" => None,
        "avx512" => Some(SimdLevel::Avx512),
        "avx2" => Some(SimdLevel::Avx2),
        "neon" => Some(SimdLevel::Neon),
        "scalar" => Some(SimdLevel::Scalar),
        _ => None,
    }
}

static KERNEL: OnceLock<DistanceKernel> = OnceLock::new();

/// Initialize the process-wide kernel, preferring (in order) the `VDB_SIMD`
/// environment variable, the caller's request, then CPU detection.
///
/// The first call wins; later calls return the already-installed kernel.
pub fn select(requested: Option<SimdLevel>) -> &'static DistanceKernel {
    KERNEL.get_or_init(|| {
        let env = std::env::var("VDB_SIMD")
            .ok()
            .and_then(|v| parse_override(&v));
        let level = env.or(requested).unwrap_or_else(detect);
        DistanceKernel::for_level(level)
    })
}

/// The process-wide kernel (auto-detected if nothing was selected yet).
#[inline]
pub fn kernel() -> &'static DistanceKernel {
    select(None)
}

// ============================================================================
// Normalization helpers
// ============================================================================

/// L2-normalize in place. A zero vector is left untouched; callers that
/// cannot accept one must check [`l2_norm`] first.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = l2_norm(v);
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// L2-normalize into a new vector.
pub fn l2_normalized(v: &[f32]) -> Vec<f32> {
    let mut out = v.to_vec();
    l2_normalize(&mut out);
    out
}

/// Euclidean norm of a vector.
#[inline]
pub fn l2_norm(v: &[f32]) -> f32 {
    kernel().dot(v, v).sqrt()
}

/// Whether `‖v‖₂` is within `tolerance` of 1.
#[inline]
pub fn is_normalized(v: &[f32], tolerance: f32) -> bool {
    (l2_norm(v) - 1.0).abs() < tolerance
}
