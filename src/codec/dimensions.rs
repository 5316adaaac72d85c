use crate::models::TransformOptions;

/// Compute the output size for a source image of `source_width` x
/// `source_height` under `options`.
///
/// Steps, in order: swap the axes for odd quarter turns, apply `scale`, shrink
/// uniformly to fit `maxWidth` then `maxHeight` (never enlarges), let explicit
/// `width`/`height` override, round to the nearest pixel. Zero limits and zero
/// explicit sizes count as unset; a zero `scale` does not.
pub fn resize_dimensions(
    source_width: u32,
    source_height: u32,
    options: &TransformOptions,
) -> (u32, u32) {
    let (mut width, mut height) = if options.quarter_turns() % 2 == 1 {
        (source_height as f64, source_width as f64)
    } else {
        (source_width as f64, source_height as f64)
    };

    if let Some(scale) = options.scale {
        width *= scale;
        height *= scale;
    }

    if let Some(max_width) = options.max_width.filter(|limit| *limit > 0) {
        let max_width = max_width as f64;
        if width > max_width {
            height *= max_width / width;
            width = max_width;
        }
    }

    if let Some(max_height) = options.max_height.filter(|limit| *limit > 0) {
        let max_height = max_height as f64;
        if height > max_height {
            width *= max_height / height;
            height = max_height;
        }
    }

    if let Some(explicit) = options.width.filter(|w| *w > 0) {
        width = explicit as f64;
    }
    if let Some(explicit) = options.height.filter(|h| *h > 0) {
        height = explicit as f64;
    }

    (to_pixels(width), to_pixels(height))
}

fn to_pixels(value: f64) -> u32 {
    if value.is_finite() {
        value.round().clamp(0.0, u32::MAX as f64) as u32
    } else {
        0
    }
}
