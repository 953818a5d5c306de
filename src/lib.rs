pub mod logging;
pub mod mesh;
pub mod simulate;
