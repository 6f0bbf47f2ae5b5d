//! Guest boot artifacts

pub mod device_tree;
