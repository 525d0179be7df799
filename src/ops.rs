//! Reference f32 kernels for NCHW tensors.
//!
//! These run the single traced forward pass and the read-back check; they
//! favour clarity over speed. Convolution lowers to im2col followed by one
//! GEMM per image so the heavy lifting stays in `ndarray`'s matrix product.

use ndarray::{Array2, Array4, ArrayD, ArrayView2, ArrayView4, Axis, Ix2, Ix4, IxDyn, s};

use crate::{Error, Result};

fn as_nchw<'a>(x: &'a ArrayD<f32>, what: &str) -> Result<ArrayView4<'a, f32>> {
    x.view()
        .into_dimensionality::<Ix4>()
        .map_err(|_| Error::Shape(format!("{} expects a 4-D tensor, got {:?}", what, x.shape())))
}

fn as_matrix<'a>(x: &'a ArrayD<f32>, what: &str) -> Result<ArrayView2<'a, f32>> {
    x.view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| Error::Shape(format!("{} expects a 2-D tensor, got {:?}", what, x.shape())))
}

/// Per-channel vector of exactly `channels` values
fn channel_vector(v: &ArrayD<f32>, channels: usize, what: &str) -> Result<Vec<f32>> {
    if v.ndim() != 1 || v.len() != channels {
        return Err(Error::Shape(format!(
            "{} must have shape [{}], got {:?}",
            what,
            channels,
            v.shape()
        )));
    }
    Ok(v.iter().copied().collect())
}

fn pooled_extent(size: usize, kernel: usize, stride: usize, padding: usize, op: &str) -> Result<usize> {
    if stride == 0 || kernel == 0 {
        return Err(Error::Shape(format!("{} needs non-zero kernel and stride", op)));
    }
    if size + 2 * padding < kernel {
        return Err(Error::Shape(format!(
            "{} kernel {} does not fit input extent {} with padding {}",
            op, kernel, size, padding
        )));
    }
    Ok((size + 2 * padding - kernel) / stride + 1)
}

/// 2-D convolution with square stride and symmetric zero padding.
///
/// `x` is `[N, C, H, W]`, `weight` is `[O, C, kH, kW]`, `bias` is `[O]`.
pub fn conv2d(
    x: &ArrayD<f32>,
    weight: &ArrayD<f32>,
    bias: Option<&ArrayD<f32>>,
    stride: usize,
    padding: usize,
) -> Result<ArrayD<f32>> {
    let x = as_nchw(x, "Conv input")?;
    let w = as_nchw(weight, "Conv weight")?;
    let (n, c, h, wd) = x.dim();
    let (o, wc, kh, kw) = w.dim();

    if wc != c {
        return Err(Error::Shape(format!(
            "Conv weight expects {} input channels, input has {}",
            wc, c
        )));
    }
    let oh = pooled_extent(h, kh, stride, padding, "Conv")?;
    let ow = pooled_extent(wd, kw, stride, padding, "Conv")?;
    let bias = bias
        .map(|b| channel_vector(b, o, "Conv bias"))
        .transpose()?;

    let k = c * kh * kw;
    let plane = oh * ow;
    let w2 = Array2::from_shape_vec((o, k), w.iter().copied().collect())?;

    let x = x.as_standard_layout();
    let xs = x
        .as_slice()
        .ok_or_else(|| Error::Shape("Conv input is not contiguous".to_string()))?;

    let mut out = Vec::with_capacity(n * o * plane);
    for b in 0..n {
        let image = &xs[b * c * h * wd..(b + 1) * c * h * wd];
        let mut cols = vec![0.0f32; k * plane];

        for ci in 0..c {
            for ki in 0..kh {
                for kj in 0..kw {
                    let row = (ci * kh + ki) * kw + kj;
                    let dst = &mut cols[row * plane..(row + 1) * plane];
                    for oy in 0..oh {
                        let iy = (oy * stride + ki) as isize - padding as isize;
                        if iy < 0 || iy >= h as isize {
                            continue;
                        }
                        let src = &image[ci * h * wd + iy as usize * wd..][..wd];
                        for ox in 0..ow {
                            let ix = (ox * stride + kj) as isize - padding as isize;
                            if ix >= 0 && ix < wd as isize {
                                dst[oy * ow + ox] = src[ix as usize];
                            }
                        }
                    }
                }
            }
        }

        let cols = Array2::from_shape_vec((k, plane), cols)?;
        let y = w2.dot(&cols);
        for (oc, row) in y.axis_iter(Axis(0)).enumerate() {
            let shift = bias.as_ref().map_or(0.0, |b| b[oc]);
            out.extend(row.iter().map(|v| v + shift));
        }
    }

    Ok(ArrayD::from_shape_vec(IxDyn(&[n, o, oh, ow]), out)?)
}

/// Per-channel mean and biased variance over `N`, `H` and `W`
pub fn batch_statistics(x: &ArrayD<f32>) -> Result<(Vec<f32>, Vec<f32>)> {
    let x = as_nchw(x, "BatchNormalization input")?;
    let mut means = Vec::with_capacity(x.dim().1);
    let mut vars = Vec::with_capacity(x.dim().1);
    for ch in x.axis_iter(Axis(1)) {
        let count = ch.len().max(1) as f32;
        let mean = ch.sum() / count;
        let var = ch.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / count;
        means.push(mean);
        vars.push(var);
    }
    Ok((means, vars))
}

/// Batch normalisation using the supplied statistics
pub fn batch_norm(
    x: &ArrayD<f32>,
    scale: &ArrayD<f32>,
    bias: &ArrayD<f32>,
    mean: &[f32],
    var: &[f32],
    epsilon: f32,
) -> Result<ArrayD<f32>> {
    let channels = as_nchw(x, "BatchNormalization input")?.dim().1;
    let scale = channel_vector(scale, channels, "BatchNormalization scale")?;
    let bias = channel_vector(bias, channels, "BatchNormalization bias")?;
    if mean.len() != channels || var.len() != channels {
        return Err(Error::Shape(format!(
            "BatchNormalization statistics must have {} channels",
            channels
        )));
    }

    let mut y = x.to_owned();
    for (c, mut ch) in y.axis_iter_mut(Axis(1)).enumerate() {
        let a = scale[c] / (var[c] + epsilon).sqrt();
        let b = bias[c] - mean[c] * a;
        ch.mapv_inplace(|v| v * a + b);
    }
    Ok(y)
}

pub fn relu(x: &ArrayD<f32>) -> ArrayD<f32> {
    x.mapv(|v| v.max(0.0))
}

/// Max pooling; padded positions never win
pub fn max_pool2d(
    x: &ArrayD<f32>,
    kernel: usize,
    stride: usize,
    padding: usize,
) -> Result<ArrayD<f32>> {
    let x = as_nchw(x, "MaxPool input")?;
    let (n, c, h, w) = x.dim();
    let oh = pooled_extent(h, kernel, stride, padding, "MaxPool")?;
    let ow = pooled_extent(w, kernel, stride, padding, "MaxPool")?;

    let out = Array4::from_shape_fn((n, c, oh, ow), |(b, ch, oy, ox)| {
        let mut best = f32::NEG_INFINITY;
        for ki in 0..kernel {
            let iy = (oy * stride + ki) as isize - padding as isize;
            if iy < 0 || iy >= h as isize {
                continue;
            }
            for kj in 0..kernel {
                let ix = (ox * stride + kj) as isize - padding as isize;
                if ix >= 0 && ix < w as isize {
                    best = best.max(x[[b, ch, iy as usize, ix as usize]]);
                }
            }
        }
        best
    });
    Ok(out.into_dyn())
}

/// Elementwise sum; `b` may broadcast to the shape of `a`
pub fn add(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    if a.shape() == b.shape() {
        return Ok(a + b);
    }
    let b = b.broadcast(a.raw_dim()).ok_or_else(|| {
        Error::Shape(format!(
            "Add cannot broadcast {:?} to {:?}",
            b.shape(),
            a.shape()
        ))
    })?;
    Ok(a + &b)
}

/// Mean over the spatial axes, keeping them as size 1
pub fn global_avg_pool(x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    let x = as_nchw(x, "GlobalAveragePool input")?;
    let (n, c, h, w) = x.dim();
    if h * w == 0 {
        return Err(Error::Shape("GlobalAveragePool over an empty plane".to_string()));
    }
    let area = (h * w) as f32;
    let out = Array4::from_shape_fn((n, c, 1, 1), |(b, ch, _, _)| {
        x.slice(s![b, ch, .., ..]).sum() / area
    });
    Ok(out.into_dyn())
}

/// Collapse to 2-D: dimensions before `axis` form rows, the rest columns
pub fn flatten(x: &ArrayD<f32>, axis: usize) -> Result<ArrayD<f32>> {
    if axis > x.ndim() {
        return Err(Error::Shape(format!(
            "Flatten axis {} out of range for rank {}",
            axis,
            x.ndim()
        )));
    }
    let rows: usize = x.shape()[..axis].iter().product();
    let cols: usize = x.shape()[axis..].iter().product();
    Ok(ArrayD::from_shape_vec(
        IxDyn(&[rows, cols]),
        x.iter().copied().collect(),
    )?)
}

/// General matrix multiply: `alpha * op(a) @ op(b) + beta * c`
pub fn gemm(
    a: &ArrayD<f32>,
    b: &ArrayD<f32>,
    c: Option<&ArrayD<f32>>,
    alpha: f32,
    beta: f32,
    trans_a: bool,
    trans_b: bool,
) -> Result<ArrayD<f32>> {
    let mut a = as_matrix(a, "Gemm A")?;
    let mut b = as_matrix(b, "Gemm B")?;
    if trans_a {
        a = a.reversed_axes();
    }
    if trans_b {
        b = b.reversed_axes();
    }
    if a.ncols() != b.nrows() {
        return Err(Error::Shape(format!(
            "Gemm inner dimensions differ: {:?} x {:?}",
            a.shape(),
            b.shape()
        )));
    }

    let mut y = a.dot(&b);
    if alpha != 1.0 {
        y *= alpha;
    }
    if let Some(c) = c {
        let c = c.broadcast(y.raw_dim()).ok_or_else(|| {
            Error::Shape(format!(
                "Gemm C {:?} does not broadcast to {:?}",
                c.shape(),
                y.shape()
            ))
        })?;
        y.zip_mut_with(&c, |out, &v| *out += beta * v);
    }
    Ok(y.into_dyn())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, array};

    fn nchw(shape: [usize; 4], values: Vec<f32>) -> ArrayD<f32> {
        ArrayD::from_shape_vec(IxDyn(&shape), values).unwrap()
    }

    #[test]
    fn conv_sums_padded_neighbourhood() {
        // all-ones 3x3 kernel over a 3x3 ramp with padding 1
        let x = nchw([1, 1, 3, 3], (1..=9).map(|v| v as f32).collect());
        let w = nchw([1, 1, 3, 3], vec![1.0; 9]);
        let y = conv2d(&x, &w, None, 1, 1).unwrap();
        assert_eq!(y.shape(), &[1, 1, 3, 3]);
        // centre sees every value, corner sees a 2x2 block
        assert_eq!(y[[0, 0, 1, 1]], 45.0);
        assert_eq!(y[[0, 0, 0, 0]], 1.0 + 2.0 + 4.0 + 5.0);
    }

    #[test]
    fn conv_applies_stride_and_bias() {
        let x = nchw([1, 2, 4, 4], vec![1.0; 32]);
        let w = nchw([3, 2, 1, 1], vec![1.0, 1.0, 2.0, 0.0, 0.0, -1.0]);
        let bias = array![0.5f32, 0.0, 1.0].into_dyn();
        let y = conv2d(&x, &w, Some(&bias), 2, 0).unwrap();
        assert_eq!(y.shape(), &[1, 3, 2, 2]);
        assert_eq!(y[[0, 0, 1, 1]], 2.5);
        assert_eq!(y[[0, 1, 0, 0]], 2.0);
        assert_eq!(y[[0, 2, 0, 1]], 0.0);
    }

    #[test]
    fn conv_rejects_channel_mismatch() {
        let x = nchw([1, 3, 4, 4], vec![0.0; 48]);
        let w = nchw([8, 1, 3, 3], vec![0.0; 72]);
        assert!(matches!(conv2d(&x, &w, None, 1, 1), Err(Error::Shape(_))));
    }

    #[test]
    fn batch_norm_normalises_with_given_statistics() {
        let x = nchw([1, 2, 1, 2], vec![1.0, 3.0, 10.0, 20.0]);
        let scale = array![2.0f32, 1.0].into_dyn();
        let bias = array![0.0f32, 1.0].into_dyn();
        let y = batch_norm(&x, &scale, &bias, &[2.0, 10.0], &[1.0, 100.0], 0.0).unwrap();
        assert_eq!(y[[0, 0, 0, 0]], -2.0);
        assert_eq!(y[[0, 0, 0, 1]], 2.0);
        assert_eq!(y[[0, 1, 0, 1]], 2.0);
    }

    #[test]
    fn batch_statistics_are_per_channel() {
        let x = nchw([2, 1, 1, 2], vec![1.0, 3.0, 5.0, 7.0]);
        let (mean, var) = batch_statistics(&x).unwrap();
        assert_eq!(mean, [4.0]);
        assert_eq!(var, [5.0]);
    }

    #[test]
    fn max_pool_ignores_padding() {
        let x = nchw([1, 1, 2, 2], vec![-4.0, -3.0, -2.0, -1.0]);
        let y = max_pool2d(&x, 3, 2, 1).unwrap();
        assert_eq!(y.shape(), &[1, 1, 1, 1]);
        assert_eq!(y[[0, 0, 0, 0]], -1.0);
    }

    #[test]
    fn pooling_and_flatten_produce_class_matrix() {
        let x = Array::from_shape_fn((2, 3, 2, 2), |(n, c, _, _)| (n * 10 + c) as f32).into_dyn();
        let pooled = global_avg_pool(&x).unwrap();
        assert_eq!(pooled.shape(), &[2, 3, 1, 1]);
        let flat = flatten(&pooled, 1).unwrap();
        assert_eq!(flat.shape(), &[2, 3]);
        assert_eq!(flat[[1, 2]], 12.0);
    }

    #[test]
    fn gemm_matches_linear_layer() {
        let x = array![[1.0f32, 2.0]].into_dyn();
        let w = array![[1.0f32, 0.0], [0.0, 1.0], [1.0, 1.0]].into_dyn();
        let b = array![0.5f32, -0.5, 0.0].into_dyn();
        let y = gemm(&x, &w, Some(&b), 1.0, 1.0, false, true).unwrap();
        assert_eq!(y, array![[1.5f32, 1.5, 3.0]].into_dyn());
    }

    #[test]
    fn add_broadcasts_and_rejects_mismatch() {
        let a = array![[1.0f32, 2.0], [3.0, 4.0]].into_dyn();
        let row = array![10.0f32, 20.0].into_dyn();
        assert_eq!(add(&a, &row).unwrap(), array![[11.0f32, 22.0], [13.0, 24.0]].into_dyn());
        let bad = array![1.0f32, 2.0, 3.0].into_dyn();
        assert!(add(&a, &bad).is_err());
        assert_eq!(relu(&array![-1.0f32, 2.0].into_dyn()), array![0.0f32, 2.0].into_dyn());
    }
}
