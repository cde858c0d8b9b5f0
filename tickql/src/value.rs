///
/// Bound parameter values.
///
/// Hosts hand the engine typed values instead of raw cell addresses; the
/// format string decides which variant each position must carry.
///

use crate::ids::Cell;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Cell(Cell),
    Array(Vec<Cell>),
    Str(String),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Cell(_) => "cell",
            Value::Array(_) => "array",
            Value::Str(_) => "string",
        }
    }
}

pub fn cell_from_f32(value: f32) -> Cell {
    value.to_bits() as Cell
}

pub fn f32_from_cell(cell: Cell) -> f32 {
    f32::from_bits(cell as u32)
}

impl From<Cell> for Value {
    fn from(value: Cell) -> Self {
        Value::Cell(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Cell(value as Cell)
    }
}

impl From<char> for Value {
    fn from(value: char) -> Self {
        Value::Cell(value as u32 as Cell)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Cell(cell_from_f32(value))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Vec<Cell>> for Value {
    fn from(value: Vec<Cell>) -> Self {
        Value::Array(value)
    }
}
