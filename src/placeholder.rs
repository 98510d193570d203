//! 预热占位帧
//!
//! 不依赖渲染源生成, 渲染源启动期间编码器先切这张图

use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

const GLYPH_W: u32 = 5;
const GLYPH_H: u32 = 7;
const BACKGROUND: Rgb<u8> = Rgb([12, 18, 32]);
const FOREGROUND: Rgb<u8> = Rgb([236, 240, 246]);
const JPEG_QUALITY: u8 = 85;

/// 深色背景上用大字显示 slug 的 JPEG
pub fn render(slug: &str, width: u32, height: u32) -> anyhow::Result<Vec<u8>> {
    let width = width.max(64);
    let height = height.max(36);
    let mut img = RgbImage::from_pixel(width, height, BACKGROUND);

    // 顶部/底部色条, 颜色由 slug 决定
    let accent = accent_for(slug);
    let bar = (height / 40).max(2);
    for y in 0..bar {
        for x in 0..width {
            img.put_pixel(x, y, accent);
            img.put_pixel(x, height - 1 - y, accent);
        }
    }

    let title = slug.to_uppercase();
    let title_scale = fit_scale(&title, width * 4 / 5, height / 4);
    let title_h = GLYPH_H * title_scale;
    let title_y = height / 2 - title_h.min(height / 2);
    draw_centered(&mut img, &title, title_y, title_scale, FOREGROUND);

    let subtitle = "LOADING";
    let sub_scale = (title_scale / 3).max(1);
    draw_centered(
        &mut img,
        subtitle,
        height / 2 + GLYPH_H * sub_scale,
        sub_scale,
        accent,
    );

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY).encode_image(&img)?;
    Ok(out)
}

fn accent_for(slug: &str) -> Rgb<u8> {
    let hash = slug
        .bytes()
        .fold(2166136261u32, |h, b| (h ^ b as u32).wrapping_mul(16777619));
    let [r, g, b, _] = hash.to_le_bytes();
    Rgb([r | 0x60, g | 0x60, b | 0x60])
}

fn text_width(text: &str, scale: u32) -> u32 {
    let n = text.chars().count() as u32;
    if n == 0 {
        return 0;
    }
    (n * (GLYPH_W + 1) - 1) * scale
}

fn fit_scale(text: &str, max_w: u32, max_h: u32) -> u32 {
    let unit_w = text_width(text, 1).max(1);
    (max_w / unit_w).min(max_h / GLYPH_H).max(1)
}

fn draw_centered(img: &mut RgbImage, text: &str, top: u32, scale: u32, color: Rgb<u8>) {
    let w = text_width(text, scale);
    let left = img.width().saturating_sub(w) / 2;
    for (i, ch) in text.chars().enumerate() {
        let x0 = left + i as u32 * (GLYPH_W + 1) * scale;
        draw_glyph(img, glyph(ch), x0, top, scale, color);
    }
}

fn draw_glyph(img: &mut RgbImage, rows: [u8; 7], x0: u32, y0: u32, scale: u32, color: Rgb<u8>) {
    for (row, bits) in rows.iter().enumerate() {
        for col in 0..GLYPH_W {
            if bits & (0x10 >> col) == 0 {
                continue;
            }
            for dy in 0..scale {
                for dx in 0..scale {
                    let x = x0 + col * scale + dx;
                    let y = y0 + row as u32 * scale + dy;
                    if x < img.width() && y < img.height() {
                        img.put_pixel(x, y, color);
                    }
                }
            }
        }
    }
}

fn glyph(ch: char) -> [u8; 7] {
    match ch {
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1E],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        ' ' => [0x00; 7],
        _ => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x00, 0x04],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_produces_jpeg_of_requested_size() {
        let bytes = render("nfl", 640, 360).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(&bytes[bytes.len() - 2..], &[0xFF, 0xD9]);

        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (640, 360));
    }

    #[test]
    fn test_long_slug_still_fits() {
        let slug = "ncaa-basketball-tournament-east";
        let scale = fit_scale(&slug.to_uppercase(), 1024, 180);
        assert!(text_width(slug, scale) <= 1024);
        assert!(render(slug, 1280, 720).is_ok());
    }

    #[test]
    fn test_accent_differs_between_slugs() {
        assert_ne!(accent_for("nfl"), accent_for("nba"));
    }
}
