pub mod builder;
pub mod graph;
pub mod node;
pub mod normalize;
pub mod op;
pub mod resources;
pub mod tensor;
pub mod tolerance;
pub mod value;
pub mod verify;
