use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::image::Image;

/// An image and its successively halved copies.
#[derive(Debug)]
pub struct Pyramid {
    /// Level 0 is the full resolution image.
    pub levels: Vec<Image>,
}

impl Pyramid {
    pub fn empty() -> Self {
        Self { levels: vec![] }
    }

    /// Rebuild from a frame's luma channel with `level_count` downscaled
    /// levels on top of the base image.
    pub fn compute(&mut self, frame: &Frame, level_count: usize) -> Result<()> {
        if self.levels.is_empty() {
            self.levels.push(Image::empty());
        }
        self.levels[0].fill_from_luma(frame);
        self.build(level_count)
    }

    pub fn from_image(image: Image, level_count: usize) -> Result<Pyramid> {
        let mut pyramid = Pyramid {
            levels: vec![image],
        };
        pyramid.build(level_count)?;
        Ok(pyramid)
    }

    fn build(&mut self, level_count: usize) -> Result<()> {
        while self.levels.len() < level_count + 1 {
            self.levels.push(Image::empty())
        }
        self.levels.truncate(level_count + 1);
        for i in 0..level_count {
            // split_at_mut so the parent can be read while the child is written
            let (head, tail) = self.levels.split_at_mut(i + 1);
            downscale(&head[i], &mut tail[0])?;
        }
        Ok(())
    }

    pub fn level(&self, level: usize) -> &Image {
        &self.levels[level]
    }

    pub fn depth(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }
}

/// downscale the parent image and store the result in child
fn downscale(parent: &Image, child: &mut Image) -> Result<()> {
    let w = parent.width as i32;
    let h = parent.height as i32;
    if w % 2 != 0 || h % 2 != 0 {
        return Err(Error::precondition(format!(
            "cannot downscale image with shape {w} x {h}"
        )));
    }

    let w_half = w / 2;
    let h_half = h / 2;
    child.data.clear();
    child.width = w_half as usize;
    child.height = h_half as usize;

    let v = |x: i32, y: i32| -> u16 { parent.value_clamped(x, y) as u16 };

    for y in 0..h_half {
        let y2 = 2 * y;
        for x in 0..w_half {
            let x2 = 2 * x;
            // 3x3 binomial kernel centred on the even pixel
            let value = v(x2, y2) / 4
                + (v(x2 + 1, y2) + v(x2 - 1, y2) + v(x2, y2 + 1) + v(x2, y2 - 1)) / 8
                + (v(x2 + 1, y2 + 1) + v(x2 - 1, y2 - 1) + v(x2 - 1, y2 + 1) + v(x2 + 1, y2 - 1))
                    / 16;
            child.data.push(value as u8);
        }
    }
    Ok(())
}
