//! sRGB ↔ CIE Lab conversion (D65 reference white).
//!
//! Only the pieces the pipeline needs: the L coordinate normalised to
//! [0, 1] for histogramming, and a full round trip so the a/b channels pass
//! through a lightness remap untouched.

/// One pixel in Lab space. `l` is normalised to [0, 1]; `a` and `b` keep
/// their usual scale (roughly [-128, 127]).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lab {
    pub l: f32,
    pub a: f32,
    pub b: f32,
}

const XN: f32 = 0.950_47;
const YN: f32 = 1.0;
const ZN: f32 = 1.088_83;

// delta = 6/29; the f(t) linear-segment threshold is delta^3.
const DELTA: f32 = 6.0 / 29.0;
const DELTA_CUBED: f32 = DELTA * DELTA * DELTA;

#[inline]
fn srgb_to_linear(channel: f32) -> f32 {
    if channel <= 0.04045 {
        channel / 12.92
    } else {
        ((channel + 0.055) / 1.055).powf(2.4)
    }
}

#[inline]
fn linear_to_srgb(channel: f32) -> f32 {
    if channel <= 0.003_130_8 {
        channel * 12.92
    } else {
        1.055 * channel.powf(1.0 / 2.4) - 0.055
    }
}

#[inline]
fn lab_f(t: f32) -> f32 {
    if t > DELTA_CUBED {
        t.cbrt()
    } else {
        t / (3.0 * DELTA * DELTA) + 4.0 / 29.0
    }
}

#[inline]
fn lab_f_inverse(t: f32) -> f32 {
    if t > DELTA {
        t * t * t
    } else {
        3.0 * DELTA * DELTA * (t - 4.0 / 29.0)
    }
}

/// Convert an 8-bit sRGB pixel to Lab.
pub fn srgb_to_lab(rgb: [u8; 3]) -> Lab {
    let r = srgb_to_linear(rgb[0] as f32 / 255.0);
    let g = srgb_to_linear(rgb[1] as f32 / 255.0);
    let b = srgb_to_linear(rgb[2] as f32 / 255.0);

    let x = 0.412_456_4 * r + 0.357_576_1 * g + 0.180_437_5 * b;
    let y = 0.212_672_9 * r + 0.715_152_2 * g + 0.072_175_0 * b;
    let z = 0.019_333_9 * r + 0.119_192_0 * g + 0.950_304_1 * b;

    let fx = lab_f(x / XN);
    let fy = lab_f(y / YN);
    let fz = lab_f(z / ZN);

    Lab {
        l: (116.0 * fy - 16.0) / 100.0,
        a: 500.0 * (fx - fy),
        b: 200.0 * (fy - fz),
    }
}

/// Convert a Lab pixel back to 8-bit sRGB, clamping out-of-gamut values.
pub fn lab_to_srgb(lab: Lab) -> [u8; 3] {
    let l_star = lab.l * 100.0;

    let fy = (l_star + 16.0) / 116.0;
    let fx = fy + lab.a / 500.0;
    let fz = fy - lab.b / 200.0;

    let x = XN * lab_f_inverse(fx);
    let y = YN * lab_f_inverse(fy);
    let z = ZN * lab_f_inverse(fz);

    let r = 3.240_454_2 * x - 1.537_138_5 * y - 0.498_531_4 * z;
    let g = -0.969_266_0 * x + 1.876_010_8 * y + 0.041_556_0 * z;
    let b = 0.055_643_4 * x - 0.204_025_9 * y + 1.057_225_2 * z;

    [quantise(r), quantise(g), quantise(b)]
}

#[inline]
fn quantise(linear: f32) -> u8 {
    let srgb = linear_to_srgb(linear.clamp(0.0, 1.0));
    (srgb * 255.0).round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn black_and_white_pin_the_lightness_range() {
        let black = srgb_to_lab([0, 0, 0]);
        assert!(black.l.abs() < 1e-4);

        let white = srgb_to_lab([255, 255, 255]);
        assert!((white.l - 1.0).abs() < 1e-3);
    }

    #[test]
    fn gray_pixels_are_neutral() {
        for value in [10u8, 64, 128, 200] {
            let lab = srgb_to_lab([value, value, value]);
            assert!(lab.a.abs() < 1e-2, "a = {}", lab.a);
            assert!(lab.b.abs() < 1e-2, "b = {}", lab.b);
        }
    }

    #[test]
    fn lightness_is_monotonic_in_gray_value() {
        let mut previous = -1.0f32;
        for value in 0..=255u8 {
            let lab = srgb_to_lab([value, value, value]);
            assert!(lab.l > previous);
            previous = lab.l;
        }
    }

    #[test]
    fn round_trip_is_lossless_within_quantisation() {
        for rgb in [[0u8, 0, 0], [255, 255, 255], [12, 200, 97], [128, 64, 32]] {
            let back = lab_to_srgb(srgb_to_lab(rgb));
            for channel in 0..3 {
                let diff = (back[channel] as i16 - rgb[channel] as i16).abs();
                assert!(diff <= 1, "{rgb:?} -> {back:?}");
            }
        }
    }
}
