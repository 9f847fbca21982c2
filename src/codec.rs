// File: src/codec.rs
//
// Binary module codec. Writes and reads the `ARDAR-TURBO` image format:
// little-endian fields, 4 bytes per instruction, constants tagged by value
// type. The writer/reader pair round-trips a module bit-exactly.

use crate::bytecode::{Instruction, Op};
use crate::errors::ArdanError;
use crate::module::{Chunk, Module};
use crate::runtime::value::{FunctionObject, Value};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::rc::Rc;

pub const MAGIC: &[u8] = b"ARDAR-TURBO";

/// On-disk value tags. The numbering covers the full runtime tag space;
/// only NUMBER, STRING, BOOLEAN and FUNCTION_REF carry payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(dead_code)]
enum ValueTag {
    Number = 0,
    String = 1,
    Boolean = 2,
    Object = 3,
    Array = 4,
    Undefined = 5,
    Null = 6,
    NativeFunction = 7,
    Function = 8,
    Method = 9,
    Promise = 10,
    FunctionRef = 11,
    Closure = 12,
    Class = 13,
}

fn tag_of(value: &Value) -> ValueTag {
    match value {
        Value::Number(_) => ValueTag::Number,
        Value::Str(_) => ValueTag::String,
        Value::Boolean(_) => ValueTag::Boolean,
        Value::Object(_) => ValueTag::Object,
        Value::Array(_) => ValueTag::Array,
        Value::Undefined => ValueTag::Undefined,
        Value::Null => ValueTag::Null,
        Value::Native(_) => ValueTag::NativeFunction,
        Value::Promise(_) => ValueTag::Promise,
        Value::FunctionRef(_) => ValueTag::FunctionRef,
        Value::Closure(_) => ValueTag::Closure,
        Value::Class(_) => ValueTag::Class,
    }
}

/// Streams a Module out as an `.ardar` image
pub struct ArdarWriter<W: Write> {
    out: W,
}

impl ArdarWriter<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self, ArdanError> {
        let file = File::create(path)
            .map_err(|e| ArdanError::bad_file(format!("Failed to open {:?}: {}", path, e)))?;
        Ok(Self { out: BufWriter::new(file) })
    }
}

impl<W: Write> ArdarWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn write_module(&mut self, module: &Module) -> Result<(), ArdanError> {
        self.write_all(MAGIC)?;
        self.write_u32(module.version)?;
        self.write_u32(module.entry_chunk_index)?;

        self.write_u32(module.chunks.len() as u32)?;
        for chunk in &module.chunks {
            self.write_chunk(chunk)?;
        }

        self.write_u32(module.constants.len() as u32)?;
        for constant in &module.constants {
            self.write_value(constant)?;
        }
        self.out
            .flush()
            .map_err(|e| ArdanError::bad_file(format!("Failed to flush module image: {}", e)))
    }

    fn write_chunk(&mut self, chunk: &Chunk) -> Result<(), ArdanError> {
        // Code size is in bytes: 4 bytes per instruction
        self.write_u32((chunk.code.len() * 4) as u32)?;
        for instr in &chunk.code {
            self.write_all(&[instr.op as u8, instr.a, instr.b, instr.c])?;
        }

        self.write_u32(chunk.constants.len() as u32)?;
        for constant in &chunk.constants {
            self.write_value(constant)?;
        }

        self.write_u32(chunk.arity)?;
        self.write_string(&chunk.name)?;
        self.write_u32(chunk.max_locals)
    }

    fn write_value(&mut self, value: &Value) -> Result<(), ArdanError> {
        self.write_all(&[tag_of(value) as u8])?;
        match value {
            Value::Number(n) => self.write_f64(*n),
            // Booleans are stored as f64 for format compatibility
            Value::Boolean(b) => self.write_f64(if *b { 1.0 } else { 0.0 }),
            Value::Str(s) => self.write_string(s),
            Value::FunctionRef(func) => {
                self.write_u32(func.chunk_index)?;
                self.write_u32(func.arity)?;
                self.write_string(&func.name)?;
                self.write_u32(func.upvalues_size)
            }
            // Other tags carry no payload
            _ => Ok(()),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), ArdanError> {
        self.out
            .write_all(bytes)
            .map_err(|e| ArdanError::bad_file(format!("Failed to write module image: {}", e)))
    }

    fn write_u32(&mut self, v: u32) -> Result<(), ArdanError> {
        self.write_all(&v.to_le_bytes())
    }

    fn write_f64(&mut self, v: f64) -> Result<(), ArdanError> {
        self.write_all(&v.to_le_bytes())
    }

    fn write_string(&mut self, s: &str) -> Result<(), ArdanError> {
        self.write_u32(s.len() as u32)?;
        self.write_all(s.as_bytes())
    }
}

/// Reads an `.ardar` image back into a Module
pub struct ArdarReader<R: Read> {
    input: R,
}

impl ArdarReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, ArdanError> {
        let file = File::open(path)
            .map_err(|e| ArdanError::bad_file(format!("Could not open {:?}: {}", path, e)))?;
        Ok(Self { input: BufReader::new(file) })
    }
}

impl<R: Read> ArdarReader<R> {
    pub fn new(input: R) -> Self {
        Self { input }
    }

    pub fn read_module(&mut self) -> Result<Module, ArdanError> {
        let mut magic = vec![0u8; MAGIC.len()];
        self.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(ArdanError::bad_file(
                "Bad magic number: not an .ardar module image".to_string(),
            ));
        }

        let mut module = Module::new();
        module.version = self.read_u32()?;
        module.entry_chunk_index = self.read_u32()?;

        let num_chunks = self.read_u32()?;
        for _ in 0..num_chunks {
            let chunk = self.read_chunk()?;
            module.chunks.push(chunk);
        }

        let num_constants = self.read_u32()?;
        module.constants = Vec::with_capacity(num_constants as usize);
        for _ in 0..num_constants {
            let value = self.read_value()?;
            module.constants.push(value);
        }
        Ok(module)
    }

    fn read_chunk(&mut self) -> Result<Chunk, ArdanError> {
        let code_size_bytes = self.read_u32()? as usize;
        if code_size_bytes % 4 != 0 {
            return Err(ArdanError::bad_file(format!(
                "Chunk code size {} is not a whole number of instructions",
                code_size_bytes
            )));
        }
        let mut chunk = Chunk::default();
        chunk.code = Vec::with_capacity(code_size_bytes / 4);
        for _ in 0..code_size_bytes / 4 {
            let mut quad = [0u8; 4];
            self.read_exact(&mut quad)?;
            let op = Op::from_u8(quad[0]).ok_or_else(|| {
                ArdanError::bad_file(format!("Unknown opcode byte {} in module image", quad[0]))
            })?;
            chunk.code.push(Instruction::new(op, quad[1], quad[2], quad[3]));
        }

        let num_constants = self.read_u32()?;
        for _ in 0..num_constants {
            let value = self.read_value()?;
            chunk.constants.push(value);
        }

        chunk.arity = self.read_u32()?;
        chunk.name = self.read_string()?;
        chunk.max_locals = self.read_u32()?;
        Ok(chunk)
    }

    fn read_value(&mut self) -> Result<Value, ArdanError> {
        let mut tag = [0u8; 1];
        self.read_exact(&mut tag)?;
        let value = match tag[0] {
            t if t == ValueTag::Number as u8 => Value::Number(self.read_f64()?),
            t if t == ValueTag::Boolean as u8 => Value::Boolean(self.read_f64()? != 0.0),
            t if t == ValueTag::String as u8 => Value::str(self.read_string()?),
            t if t == ValueTag::FunctionRef as u8 => {
                let chunk_index = self.read_u32()?;
                let arity = self.read_u32()?;
                let name = self.read_string()?;
                let upvalues_size = self.read_u32()?;
                Value::FunctionRef(Rc::new(FunctionObject {
                    chunk_index,
                    arity,
                    name,
                    upvalues_size,
                    is_async: false,
                }))
            }
            t if t == ValueTag::Undefined as u8 => Value::Undefined,
            t if t == ValueTag::Null as u8 => Value::Null,
            // Unknown tags carry no payload and are skipped
            _ => Value::Undefined,
        };
        Ok(value)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ArdanError> {
        self.input.read_exact(buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                ArdanError::bad_file("Module image ends prematurely".to_string())
            }
            _ => ArdanError::bad_file(format!("Failed to read module image: {}", e)),
        })
    }

    fn read_u32(&mut self) -> Result<u32, ArdanError> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_f64(&mut self) -> Result<f64, ArdanError> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(f64::from_le_bytes(buf))
    }

    fn read_string(&mut self) -> Result<String, ArdanError> {
        let len = self.read_u32()? as usize;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        String::from_utf8(buf)
            .map_err(|e| ArdanError::bad_file(format!("Invalid UTF-8 in module image: {}", e)))
    }
}

/// Serialize a module to an in-memory image
pub fn module_to_bytes(module: &Module) -> Result<Vec<u8>, ArdanError> {
    let mut bytes = Vec::new();
    ArdarWriter::new(&mut bytes).write_module(module)?;
    Ok(bytes)
}

/// Deserialize a module from an in-memory image
pub fn module_from_bytes(bytes: &[u8]) -> Result<Module, ArdanError> {
    ArdarReader::new(bytes).read_module()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Instruction, Op};

    fn sample_module() -> Module {
        let mut module = Module::new();
        let mut chunk = Chunk::new("entry");
        chunk.arity = 2;
        chunk.max_locals = 4;
        let k = chunk.add_constant(Value::Number(42.0));
        chunk.add_constant(Value::str("hello"));
        chunk.add_constant(Value::Boolean(true));
        chunk.emit(Instruction::new(Op::LoadConst, 0, k as u8, 0));
        chunk.emit(Instruction::new(Op::Return, 0, 0, 0));
        module.entry_chunk_index = module.add_chunk(chunk);
        module.add_constant(Value::FunctionRef(Rc::new(FunctionObject {
            chunk_index: 0,
            arity: 2,
            name: "entry".to_string(),
            upvalues_size: 3,
            is_async: false,
        })));
        module
    }

    #[test]
    fn round_trip_preserves_everything() {
        let module = sample_module();
        let bytes = module_to_bytes(&module).unwrap();
        let back = module_from_bytes(&bytes).unwrap();
        assert_eq!(module, back);
    }

    #[test]
    fn image_starts_with_magic() {
        let bytes = module_to_bytes(&sample_module()).unwrap();
        assert!(bytes.starts_with(MAGIC));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = module_to_bytes(&sample_module()).unwrap();
        bytes[0] = b'X';
        let err = module_from_bytes(&bytes).unwrap_err();
        assert!(err.message.contains("magic"));
    }

    #[test]
    fn truncated_image_is_rejected() {
        let bytes = module_to_bytes(&sample_module()).unwrap();
        let err = module_from_bytes(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(err.message.contains("prematurely"));
    }

    #[test]
    fn booleans_round_trip_through_f64_payload() {
        let mut module = Module::new();
        let mut chunk = Chunk::new("b");
        chunk.add_constant(Value::Boolean(true));
        chunk.add_constant(Value::Boolean(false));
        module.entry_chunk_index = module.add_chunk(chunk);
        let back = module_from_bytes(&module_to_bytes(&module).unwrap()).unwrap();
        assert_eq!(back.chunks[0].constants[0], Value::Boolean(true));
        assert_eq!(back.chunks[0].constants[1], Value::Boolean(false));
    }
}
