pub mod secreth;
