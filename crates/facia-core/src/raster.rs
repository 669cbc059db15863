//! Grayscale raster helpers shared by the quality gate and the model
//! adapters.

/// Owned grayscale buffer with its dimensions.
#[derive(Debug, Clone)]
pub(crate) struct GrayBuf {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
}

impl GrayBuf {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Crop `[x, y, w, h]` out of a grayscale buffer, clamped to its bounds.
/// Degenerate rectangles produce an empty crop.
pub(crate) fn crop(gray: &[u8], width: usize, height: usize, rect: (f32, f32, f32, f32)) -> GrayBuf {
    let (rx, ry, rw, rh) = rect;
    let x0 = rx.floor().max(0.0) as usize;
    let y0 = ry.floor().max(0.0) as usize;
    let x1 = ((rx + rw).ceil() as i64).clamp(0, width as i64) as usize;
    let y1 = ((ry + rh).ceil() as i64).clamp(0, height as i64) as usize;

    if x0 >= x1 || y0 >= y1 {
        return GrayBuf { data: Vec::new(), width: 0, height: 0 };
    }

    let (cw, ch) = (x1 - x0, y1 - y0);
    let mut data = Vec::with_capacity(cw * ch);
    for y in y0..y1 {
        data.extend_from_slice(&gray[y * width + x0..y * width + x1]);
    }
    GrayBuf { data, width: cw, height: ch }
}

/// Bilinear resize of a grayscale buffer.
pub(crate) fn resize_bilinear(src: &GrayBuf, dst_w: usize, dst_h: usize) -> GrayBuf {
    if src.is_empty() || dst_w == 0 || dst_h == 0 {
        return GrayBuf { data: Vec::new(), width: 0, height: 0 };
    }

    let scale_x = src.width as f32 / dst_w as f32;
    let scale_y = src.height as f32 / dst_h as f32;
    let mut data = vec![0u8; dst_w * dst_h];

    for y in 0..dst_h {
        let src_y = (y as f32 + 0.5) * scale_y - 0.5;
        let y0 = (src_y.floor() as i64).clamp(0, src.height as i64 - 1) as usize;
        let y1 = (y0 + 1).min(src.height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..dst_w {
            let src_x = (x as f32 + 0.5) * scale_x - 0.5;
            let x0 = (src_x.floor() as i64).clamp(0, src.width as i64 - 1) as usize;
            let x1 = (x0 + 1).min(src.width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = src.data[y0 * src.width + x0] as f32;
            let tr = src.data[y0 * src.width + x1] as f32;
            let bl = src.data[y1 * src.width + x0] as f32;
            let br = src.data[y1 * src.width + x1] as f32;

            let top = tl * (1.0 - fx) + tr * fx;
            let bottom = bl * (1.0 - fx) + br * fx;
            data[y * dst_w + x] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
        }
    }

    GrayBuf { data, width: dst_w, height: dst_h }
}

/// Mean and standard deviation of pixel intensities.
pub(crate) fn mean_stddev(data: &[u8]) -> (f32, f32) {
    if data.is_empty() {
        return (0.0, 0.0);
    }
    let n = data.len() as f32;
    let mean = data.iter().map(|&p| p as f32).sum::<f32>() / n;
    let variance = data.iter().map(|&p| (p as f32 - mean).powi(2)).sum::<f32>() / n;
    (mean, variance.sqrt())
}

/// Variance of the 4-neighbor Laplacian response over interior pixels.
/// The standard focus measure: sharp detail produces large responses, a
/// defocused crop produces responses near zero.
pub(crate) fn laplacian_variance(buf: &GrayBuf) -> f32 {
    if buf.width < 3 || buf.height < 3 {
        return 0.0;
    }

    let (w, h) = (buf.width, buf.height);
    let mut responses = Vec::with_capacity((w - 2) * (h - 2));
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let center = buf.data[y * w + x] as f32;
            let up = buf.data[(y - 1) * w + x] as f32;
            let down = buf.data[(y + 1) * w + x] as f32;
            let left = buf.data[y * w + x - 1] as f32;
            let right = buf.data[y * w + x + 1] as f32;
            responses.push(up + down + left + right - 4.0 * center);
        }
    }

    let n = responses.len() as f32;
    let mean = responses.iter().sum::<f32>() / n;
    responses.iter().map(|r| (r - mean).powi(2)).sum::<f32>() / n
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkerboard(width: usize, height: usize, low: u8, high: u8) -> GrayBuf {
        let data = (0..width * height)
            .map(|i| {
                let (x, y) = (i % width, i / width);
                if (x + y) % 2 == 0 { low } else { high }
            })
            .collect();
        GrayBuf { data, width, height }
    }

    #[test]
    fn test_crop_interior() {
        let src: Vec<u8> = (0..16).collect();
        let out = crop(&src, 4, 4, (1.0, 1.0, 2.0, 2.0));
        assert_eq!(out.width, 2);
        assert_eq!(out.height, 2);
        assert_eq!(out.data, vec![5, 6, 9, 10]);
    }

    #[test]
    fn test_crop_clamps_to_bounds() {
        let src: Vec<u8> = (0..16).collect();
        let out = crop(&src, 4, 4, (-5.0, 2.0, 100.0, 100.0));
        assert_eq!(out.width, 4);
        assert_eq!(out.height, 2);
        assert_eq!(out.data, vec![8, 9, 10, 11, 12, 13, 14, 15]);
    }

    #[test]
    fn test_crop_degenerate_rect_is_empty() {
        let src = vec![0u8; 16];
        let out = crop(&src, 4, 4, (10.0, 10.0, 2.0, 2.0));
        assert!(out.is_empty());
    }

    #[test]
    fn test_resize_uniform_stays_uniform() {
        let src = GrayBuf { data: vec![128u8; 10 * 10], width: 10, height: 10 };
        let out = resize_bilinear(&src, 25, 17);
        assert_eq!(out.width, 25);
        assert_eq!(out.height, 17);
        assert!(out.data.iter().all(|&p| p == 128));
    }

    #[test]
    fn test_resize_preserves_mean_roughly() {
        let src = checkerboard(8, 8, 0, 200);
        let out = resize_bilinear(&src, 16, 16);
        let (mean, _) = mean_stddev(&out.data);
        assert!((mean - 100.0).abs() < 10.0, "mean drifted: {mean}");
    }

    #[test]
    fn test_mean_stddev_flat() {
        let (mean, stddev) = mean_stddev(&[50u8; 100]);
        assert_eq!(mean, 50.0);
        assert_eq!(stddev, 0.0);
    }

    #[test]
    fn test_mean_stddev_bimodal() {
        let mut data = vec![0u8; 50];
        data.extend(vec![200u8; 50]);
        let (mean, stddev) = mean_stddev(&data);
        assert!((mean - 100.0).abs() < 1e-3);
        assert!((stddev - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_laplacian_flat_is_zero() {
        let buf = GrayBuf { data: vec![90u8; 64], width: 8, height: 8 };
        assert_eq!(laplacian_variance(&buf), 0.0);
    }

    #[test]
    fn test_laplacian_checkerboard_is_large() {
        let buf = checkerboard(8, 8, 0, 255);
        assert!(laplacian_variance(&buf) > 1000.0);
    }

    #[test]
    fn test_laplacian_tiny_buffer() {
        let buf = GrayBuf { data: vec![0u8; 4], width: 2, height: 2 };
        assert_eq!(laplacian_variance(&buf), 0.0);
    }
}
