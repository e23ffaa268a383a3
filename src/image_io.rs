use std::path::Path;

use anyhow::{anyhow, Result};
use image::{imageops::FilterType, GenericImageView};
use ndarray::Array4;
use tch::{Device, Kind, Tensor};

use style_transfer::networks::transform::IMAGE_CHANNELS;

/// Read an image, resized to `height`x`width`, as a `[1, 3, height, width]`
/// array of 0-255 values.
pub fn load_rgb(path: impl AsRef<Path>, height: i64, width: i64) -> Result<Array4<f32>> {
    let img = image::open(path)?.resize_exact(width as u32, height as u32, FilterType::Triangle);
    let mut array = Array4::<f32>::zeros((1, IMAGE_CHANNELS as usize, height as usize, width as usize));
    for y in 0..img.height() {
        for x in 0..img.width() {
            let pixel = img.get_pixel(x, y);
            array[[0, 0, y as usize, x as usize]] = pixel.0[0] as f32;
            array[[0, 1, y as usize, x as usize]] = pixel.0[1] as f32;
            array[[0, 2, y as usize, x as usize]] = pixel.0[2] as f32;
        }
    }
    Ok(array)
}

pub fn to_tensor(array: Array4<f32>, device: Device) -> Result<Tensor> {
    let tensor: Tensor = array.try_into()?;
    Ok(tensor.to_device(device))
}

/// Write the first image of an NCHW batch of 0-255 values as a PNG.
pub fn save_rgb(tensor: &Tensor, path: impl AsRef<Path>) -> Result<()> {
    let size = tensor.size();
    let &[_, 3, height, width] = size.as_slice() else {
        return Err(anyhow!("expected an RGB batch, got size {:?}", size));
    };
    let hwc = tensor
        .get(0)
        .permute([1, 2, 0])
        .clamp(0.0, 255.0)
        .round()
        .to_kind(Kind::Uint8)
        .to_device(Device::Cpu)
        .contiguous()
        .view([-1]);
    let mut data = vec![0u8; hwc.numel()];
    hwc.copy_data(&mut data, hwc.numel());
    let img = image::RgbImage::from_raw(width as u32, height as u32, data)
        .ok_or_else(|| anyhow!("pixel buffer does not match {}x{}", width, height))?;
    img.save(path)?;
    Ok(())
}
