// File: src/runtime/mod.rs
//
// Runtime data model shared by the compiler, the VM and the module codec:
// values, property-carrying objects, binding environments, promises and the
// event loop.

pub mod environment;
pub mod event_loop;
pub mod object;
pub mod promise;
pub mod value;

pub use environment::{Env, ExecutionContext};
pub use event_loop::{EventLoop, Task, Waker};
pub use object::{Array, Class, Modifiers, Object, PropertySlot, SlotKind, CONSTRUCTOR};
pub use promise::{Awaiter, Promise, PromiseState, Reaction};
pub use value::{
    Closure, FunctionObject, NativeFunction, Upvalue, Value, VmError, VmResult,
};
