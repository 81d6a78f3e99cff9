//! Minimal raster drawing on an `image::RgbImage`: rectangles, thick lines,
//! discs, pie wedges and a 5×7 bitmap font. Enough for legible business
//! charts without a font file or a plotting dependency.

use image::{Rgb, RgbImage};

pub const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
pub const INK: Rgb<u8> = Rgb([40, 44, 52]);
pub const GRID: Rgb<u8> = Rgb([225, 228, 232]);
pub const AXIS: Rgb<u8> = Rgb([120, 126, 134]);

/// Series colours, cycled.
pub const PALETTE: [Rgb<u8>; 8] = [
    Rgb([31, 119, 180]),
    Rgb([255, 127, 14]),
    Rgb([44, 160, 44]),
    Rgb([214, 39, 40]),
    Rgb([148, 103, 189]),
    Rgb([140, 86, 75]),
    Rgb([227, 119, 194]),
    Rgb([23, 190, 207]),
];

const GLYPH_W: u32 = 5;
const GLYPH_H: u32 = 7;

pub struct Canvas {
    img: RgbImage,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            img: RgbImage::from_pixel(width, height, WHITE),
        }
    }

    pub fn width(&self) -> u32 {
        self.img.width()
    }

    pub fn height(&self) -> u32 {
        self.img.height()
    }

    pub fn into_image(self) -> RgbImage {
        self.img
    }

    fn put(&mut self, x: i64, y: i64, c: Rgb<u8>) {
        if x >= 0 && y >= 0 && (x as u32) < self.img.width() && (y as u32) < self.img.height() {
            self.img.put_pixel(x as u32, y as u32, c);
        }
    }

    pub fn fill_rect(&mut self, x0: i64, y0: i64, x1: i64, y1: i64, c: Rgb<u8>) {
        let (xa, xb) = (x0.min(x1), x0.max(x1));
        let (ya, yb) = (y0.min(y1), y0.max(y1));
        for y in ya..=yb {
            for x in xa..=xb {
                self.put(x, y, c);
            }
        }
    }

    pub fn hline(&mut self, x0: i64, x1: i64, y: i64, c: Rgb<u8>) {
        self.fill_rect(x0, y, x1, y, c);
    }

    pub fn vline(&mut self, x: i64, y0: i64, y1: i64, c: Rgb<u8>) {
        self.fill_rect(x, y0, x, y1, c);
    }

    /// Bresenham line stamped with a square brush of `thickness` pixels.
    pub fn line(&mut self, x0: i64, y0: i64, x1: i64, y1: i64, thickness: i64, c: Rgb<u8>) {
        let half = thickness.max(1) / 2;
        let (mut x, mut y) = (x0, y0);
        let dx = (x1 - x0).abs();
        let dy = -(y1 - y0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        loop {
            self.fill_rect(x - half, y - half, x + half, y + half, c);
            if x == x1 && y == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }

    pub fn disc(&mut self, cx: i64, cy: i64, r: i64, c: Rgb<u8>) {
        for y in -r..=r {
            for x in -r..=r {
                if x * x + y * y <= r * r {
                    self.put(cx + x, cy + y, c);
                }
            }
        }
    }

    /// Fill the wedge between `start` and `end` radians, clockwise from
    /// 12 o'clock.
    pub fn wedge(&mut self, cx: i64, cy: i64, r: i64, start: f64, end: f64, c: Rgb<u8>) {
        use std::f64::consts::{FRAC_PI_2, TAU};
        for y in -r..=r {
            for x in -r..=r {
                if x * x + y * y > r * r {
                    continue;
                }
                let mut a = (y as f64).atan2(x as f64) + FRAC_PI_2;
                if a < 0.0 {
                    a += TAU;
                }
                if a >= start && a < end {
                    self.put(cx + x, cy + y, c);
                }
            }
        }
    }

    /// Draw `text` with its top-left corner at (`x`, `y`).
    pub fn text(&mut self, x: i64, y: i64, text: &str, scale: u32, c: Rgb<u8>) {
        let s = scale.max(1) as i64;
        let mut pen = x;
        for ch in text.chars() {
            let rows = glyph(ch);
            for (row, bits) in rows.iter().enumerate() {
                for col in 0..GLYPH_W {
                    if bits & (1 << (GLYPH_W - 1 - col)) != 0 {
                        let px = pen + col as i64 * s;
                        let py = y + row as i64 * s;
                        self.fill_rect(px, py, px + s - 1, py + s - 1, c);
                    }
                }
            }
            pen += (GLYPH_W as i64 + 1) * s;
        }
    }

    pub fn text_centered(&mut self, cx: i64, y: i64, text: &str, scale: u32, c: Rgb<u8>) {
        let w = text_width(text, scale) as i64;
        self.text(cx - w / 2, y, text, scale, c);
    }

    pub fn text_right(&mut self, right: i64, y: i64, text: &str, scale: u32, c: Rgb<u8>) {
        let w = text_width(text, scale) as i64;
        self.text(right - w, y, text, scale, c);
    }
}

pub fn text_width(text: &str, scale: u32) -> u32 {
    let n = text.chars().count() as u32;
    if n == 0 {
        return 0;
    }
    (n * (GLYPH_W + 1) - 1) * scale.max(1)
}

pub fn text_height(scale: u32) -> u32 {
    GLYPH_H * scale.max(1)
}

/// Shorten `text` with a trailing ".." so it fits `max_px`.
pub fn fit_text(text: &str, scale: u32, max_px: u32) -> String {
    if text_width(text, scale) <= max_px {
        return text.to_string();
    }
    let per = (GLYPH_W + 1) * scale.max(1);
    let keep = (max_px / per).saturating_sub(2) as usize;
    let mut s: String = text.chars().take(keep).collect();
    s.push_str("..");
    s
}

fn glyph(c: char) -> [u8; 7] {
    match c.to_ascii_uppercase() {
        ' ' => [0; 7],
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
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
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
        '.' => [0, 0, 0, 0, 0, 0x0C, 0x0C],
        ',' => [0, 0, 0, 0, 0x0C, 0x04, 0x08],
        '-' => [0, 0, 0, 0x1F, 0, 0, 0],
        '+' => [0, 0x04, 0x04, 0x1F, 0x04, 0x04, 0],
        '%' => [0x18, 0x19, 0x02, 0x04, 0x08, 0x13, 0x03],
        '$' => [0x04, 0x0F, 0x14, 0x0E, 0x05, 0x1E, 0x04],
        ':' => [0, 0x0C, 0x0C, 0, 0x0C, 0x0C, 0],
        '(' => [0x02, 0x04, 0x08, 0x08, 0x08, 0x04, 0x02],
        ')' => [0x08, 0x04, 0x02, 0x02, 0x02, 0x04, 0x08],
        '/' => [0, 0x01, 0x02, 0x04, 0x08, 0x10, 0],
        '\'' => [0x0C, 0x04, 0x08, 0, 0, 0, 0],
        '&' => [0x0C, 0x12, 0x14, 0x08, 0x15, 0x12, 0x0D],
        '_' => [0, 0, 0, 0, 0, 0, 0x1F],
        '#' => [0x0A, 0x0A, 0x1F, 0x0A, 0x1F, 0x0A, 0x0A],
        _ => [0x0E, 0x11, 0x01, 0x02, 0x04, 0, 0x04],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_metrics() {
        assert_eq!(text_width("", 2), 0);
        assert_eq!(text_width("AB", 1), 11);
        assert_eq!(text_height(2), 14);
        assert_eq!(fit_text("January", 1, 1000), "January");
        let fitted = fit_text("A very long category label", 1, 60);
        assert!(text_width(&fitted, 1) <= 60);
        assert!(fitted.ends_with(".."));
    }

    #[test]
    fn drawing_stays_in_bounds() {
        let mut c = Canvas::new(40, 30);
        c.line(-10, -10, 100, 100, 3, INK);
        c.disc(39, 29, 5, PALETTE[0]);
        c.text(35, 25, "OVERFLOW", 2, INK);
        let img = c.into_image();
        assert_eq!(img.get_pixel(0, 0), &INK);
    }

    #[test]
    fn wedge_covers_quadrant() {
        let mut c = Canvas::new(41, 41);
        c.wedge(20, 20, 20, 0.0, std::f64::consts::FRAC_PI_2, PALETTE[1]);
        let img = c.into_image();
        // Upper-right quadrant is filled, lower-left is not.
        assert_eq!(img.get_pixel(30, 10), &PALETTE[1]);
        assert_eq!(img.get_pixel(10, 30), &WHITE);
    }
}
