use burn::prelude::*;
use image::{imageops, RgbImage};
use std::path::Path;

use crate::error::{Error, Result};

pub fn load_image<P: AsRef<Path>>(path: P) -> Result<RgbImage> {
    Ok(image::open(path)?.to_rgb8())
}

/// Crops the bottom and right edges so both sides are multiples of `multiple`.
pub fn crop_to_multiple(image: RgbImage, multiple: u32) -> Result<RgbImage> {
    if multiple == 0 {
        return Err(Error::InvalidInput("crop multiple must be positive".to_string()));
    }

    let (width, height) = image.dimensions();
    let (new_width, new_height) = (width - width % multiple, height - height % multiple);
    if new_width == 0 || new_height == 0 {
        return Err(Error::InvalidInput(format!(
            "{width}x{height} image is smaller than {multiple}x{multiple}"
        )));
    }
    if (new_width, new_height) == (width, height) {
        return Ok(image);
    }

    log::warn!("cropping {width}x{height} image to {new_width}x{new_height}");
    let cropped = imageops::crop_imm(&image, 0, 0, new_width, new_height);
    Ok(cropped.to_image())
}

/// `[3, height, width]` tensor with pixel values mapped to `[-1, 1]`.
pub fn image_to_tensor<B: Backend>(image: RgbImage, device: &B::Device) -> Tensor<B, 3> {
    let (width, height) = image.dimensions();
    let pixels = image
        .into_raw()
        .into_iter()
        .map(|c| c as f32)
        .collect::<Vec<_>>();

    Tensor::<B, 3>::from_data(
        TensorData::new(pixels, [height as usize, width as usize, 3]),
        device,
    )
    .permute([2, 0, 1])
    .div_scalar(127.5)
    .sub_scalar(1.0)
}

/// Inverse of [`image_to_tensor`]; values outside `[-1, 1]` are clamped.
pub fn tensor_to_image<B: Backend>(tensor: Tensor<B, 3>) -> Result<RgbImage> {
    let [channels, height, width] = tensor.dims();
    if channels != 3 {
        return Err(Error::InvalidInput(format!(
            "expected an RGB tensor, got {channels} channels"
        )));
    }

    let pixels = tensor
        .add_scalar(1.0)
        .mul_scalar(127.5)
        .clamp(0.0, 255.0)
        .permute([1, 2, 0])
        .into_data()
        .to_vec::<f32>()
        .map_err(|err| Error::TensorData(format!("{err:?}")))?
        .into_iter()
        .map(|c| c.round() as u8)
        .collect::<Vec<_>>();

    RgbImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| Error::TensorData("pixel buffer does not fit the image".to_string()))
}

/// Reads a planar `[3, height, width]` buffer of `0..=255` values as a
/// `[1, 3, height, width]` tensor in `[-1, 1]`.
pub fn pixels_to_tensor<B: Backend>(
    pixels: Vec<f32>,
    width: usize,
    height: usize,
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    let expected = width
        .checked_mul(height)
        .and_then(|area| area.checked_mul(3))
        .ok_or_else(|| Error::InvalidInput(format!("{width}x{height} image is too large")))?;
    if pixels.len() != expected {
        return Err(Error::InvalidInput(format!(
            "expected {expected} values for a {width}x{height} image, got {}",
            pixels.len()
        )));
    }

    let tensor = Tensor::<B, 3>::from_data(TensorData::new(pixels, [3, height, width]), device)
        .div_scalar(127.5)
        .sub_scalar(1.0);

    Ok(tensor.unsqueeze())
}

/// Inverse of [`pixels_to_tensor`] for a single image. Values are not
/// clamped or rounded.
pub fn tensor_to_pixels<B: Backend>(tensor: Tensor<B, 3>) -> Result<Vec<f32>> {
    let pixels = tensor
        .add_scalar(1.0)
        .mul_scalar(127.5)
        .into_data()
        .to_vec::<f32>()
        .map_err(|err| Error::TensorData(format!("{err:?}")))?;

    Ok(pixels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InferenceBackend as TestBackend;
    use image::Rgb;

    #[test]
    fn pixels_map_onto_unit_range() {
        let device = Default::default();
        let mut image = RgbImage::new(2, 1);
        image.put_pixel(0, 0, Rgb([0, 255, 0]));
        image.put_pixel(1, 0, Rgb([255, 0, 255]));

        let tensor = image_to_tensor::<TestBackend>(image.clone(), &device);
        assert_eq!(tensor.dims(), [3, 1, 2]);
        let values = tensor.clone().into_data().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![-1.0, 1.0, 1.0, -1.0, -1.0, 1.0]);

        assert_eq!(tensor_to_image(tensor).unwrap(), image);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 3>::from_data([[[3.0]], [[-3.0]], [[0.0]]], &device);
        let image = tensor_to_image(tensor).unwrap();
        assert_eq!(image.get_pixel(0, 0), &Rgb([255, 0, 128]));
    }

    #[test]
    fn crops_to_multiples() {
        let image = crop_to_multiple(RgbImage::new(10, 13), 4).unwrap();
        assert_eq!(image.dimensions(), (8, 12));

        let image = crop_to_multiple(RgbImage::new(8, 8), 4).unwrap();
        assert_eq!(image.dimensions(), (8, 8));

        assert!(crop_to_multiple(RgbImage::new(3, 8), 4).is_err());
    }

    #[test]
    fn zero_crop_multiple_is_rejected() {
        let result = crop_to_multiple(RgbImage::new(8, 8), 0);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn planar_buffer_round_trips() {
        let device = Default::default();
        let pixels = vec![0.0, 127.5, 255.0, 0.0, 127.5, 255.0];

        let tensor: Tensor<TestBackend, 4> =
            pixels_to_tensor(pixels.clone(), 2, 1, &device).unwrap();
        assert_eq!(tensor.dims(), [1, 3, 1, 2]);
        let values = tensor.clone().into_data().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![-1.0, 0.0, 1.0, -1.0, 0.0, 1.0]);

        assert_eq!(tensor_to_pixels(tensor.squeeze(0)).unwrap(), pixels);
    }

    #[test]
    fn planar_buffer_length_is_checked() {
        let device = Default::default();

        let result = pixels_to_tensor::<TestBackend>(vec![0.0; 5], 2, 1, &device);
        assert!(matches!(result, Err(Error::InvalidInput(_))));

        let result = pixels_to_tensor::<TestBackend>(vec![], usize::MAX, 2, &device);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
