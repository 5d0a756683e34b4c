//! Raw-buffer image operations shared by the detector backends and the
//! descriptor extractor: grayscale conversion, bilinear resize, cropping.
//!
//! All functions operate on packed RGB24 (`height * width * 3` bytes) or
//! 8-bit grayscale buffers; nothing here allocates an image container.

/// Convert packed RGB24 to 8-bit grayscale using BT.601 luma weights.
pub fn rgb_to_grayscale(rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
    let pixels = (width * height) as usize;
    let mut gray = Vec::with_capacity(pixels);
    for idx in 0..pixels {
        let off = idx * 3;
        let (r, g, b) = match rgb.get(off..off + 3) {
            Some(px) => (px[0] as f32, px[1] as f32, px[2] as f32),
            None => (0.0, 0.0, 0.0),
        };
        gray.push((0.299 * r + 0.587 * g + 0.114 * b).round().clamp(0.0, 255.0) as u8);
    }
    gray
}

/// Resize a packed RGB24 buffer with bilinear interpolation.
///
/// Sub-pixel sampling uses pixel-center alignment so a 2× upscale followed
/// by a 2× downscale stays close to the original.
pub fn resize_rgb(
    rgb: &[u8],
    width: u32,
    height: u32,
    new_width: u32,
    new_height: u32,
) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let (nw, nh) = (new_width as usize, new_height as usize);
    if w == 0 || h == 0 || nw == 0 || nh == 0 {
        return Vec::new();
    }

    let x_ratio = w as f32 / nw as f32;
    let y_ratio = h as f32 / nh as f32;
    let mut out = vec![0u8; nw * nh * 3];

    for y in 0..nh {
        let src_y = (y as f32 + 0.5) * y_ratio - 0.5;
        let y0 = (src_y.floor() as i64).clamp(0, h as i64 - 1) as usize;
        let y1 = (y0 + 1).min(h - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..nw {
            let src_x = (x as f32 + 0.5) * x_ratio - 0.5;
            let x0 = (src_x.floor() as i64).clamp(0, w as i64 - 1) as usize;
            let x1 = (x0 + 1).min(w - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            for c in 0..3 {
                let tl = rgb[(y0 * w + x0) * 3 + c] as f32;
                let tr = rgb[(y0 * w + x1) * 3 + c] as f32;
                let bl = rgb[(y1 * w + x0) * 3 + c] as f32;
                let br = rgb[(y1 * w + x1) * 3 + c] as f32;

                let val = tl * (1.0 - fx) * (1.0 - fy)
                    + tr * fx * (1.0 - fy)
                    + bl * (1.0 - fx) * fy
                    + br * fx * fy;

                out[(y * nw + x) * 3 + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    out
}

/// Copy a rectangular region out of a packed RGB24 buffer.
///
/// The region is clamped to the frame; callers get exactly
/// `crop_w * crop_h * 3` bytes with out-of-frame pixels left black.
pub fn crop_rgb(
    rgb: &[u8],
    width: u32,
    height: u32,
    left: i64,
    top: i64,
    crop_w: u32,
    crop_h: u32,
) -> Vec<u8> {
    let (w, h) = (width as i64, height as i64);
    let mut out = vec![0u8; (crop_w * crop_h * 3) as usize];

    for y in 0..crop_h as i64 {
        let src_y = top + y;
        if src_y < 0 || src_y >= h {
            continue;
        }
        for x in 0..crop_w as i64 {
            let src_x = left + x;
            if src_x < 0 || src_x >= w {
                continue;
            }
            let src = ((src_y * w + src_x) * 3) as usize;
            let dst = ((y * crop_w as i64 + x) * 3) as usize;
            out[dst..dst + 3].copy_from_slice(&rgb[src..src + 3]);
        }
    }

    out
}
