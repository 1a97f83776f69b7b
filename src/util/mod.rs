pub mod fd;
