//! Built-in module implementations.

pub mod calculate_group_mean;
pub mod flag_image;
pub mod load_images;
pub mod measure_image_intensity;

pub use calculate_group_mean::CalculateGroupMean;
pub use flag_image::FlagImage;
pub use load_images::LoadImages;
pub use measure_image_intensity::MeasureImageIntensity;

use crate::module::registry::ModuleRegistry;

pub(crate) fn register_all(registry: &mut ModuleRegistry) {
    registry
        .register(load_images::MODULE_NAME, || Box::new(LoadImages::new()))
        .register(measure_image_intensity::MODULE_NAME, || {
            Box::new(MeasureImageIntensity::new())
        })
        .register(flag_image::MODULE_NAME, || Box::new(FlagImage::new()))
        .register(calculate_group_mean::MODULE_NAME, || {
            Box::new(CalculateGroupMean::new())
        })
        .alias("FlagImages", flag_image::MODULE_NAME)
        .alias("MeasureImageIntensities", measure_image_intensity::MODULE_NAME);
}
