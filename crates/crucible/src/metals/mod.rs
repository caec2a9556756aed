pub mod flashattention;
