pub mod memory;
pub mod openstack;
