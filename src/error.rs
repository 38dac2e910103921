use crate::graph::GraphError;
use crate::memory::MemoryError;
use crate::shape::ShapeError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("graph error")]
    Graph(GraphError),
    #[error("memory error")]
    Memory(MemoryError),
    #[error("shape error")]
    Shape(ShapeError),
}
