pub mod adapters;
pub mod bucket;
pub mod fs;
pub mod fuse;
pub mod handle;
pub mod lister;
pub mod model;
pub mod mount;
pub mod stub;
pub mod util;
