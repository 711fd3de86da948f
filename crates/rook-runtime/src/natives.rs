//! Built-in native functions.
//!
//! A fixed registry installed at VM construction. Arity is checked by the
//! VM before the call; argument types are checked here, and a violation
//! becomes a runtime error.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::value::Value;
use crate::vm::Vm;

/// `clock()` - seconds since the Unix epoch, as a number.
pub fn clock_native(_vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(Value::Number(seconds))
}

/// `env(name)` - the value of an environment variable as a string, or nil
/// when it is unset or not valid Unicode.
pub fn env_native(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let Some(name) = vm.value_as_string(args[0]) else {
        return Err("Argument to 'env' must be a string.".to_string());
    };
    match std::env::var(&name) {
        Ok(value) => Ok(vm.string_value(&value)),
        Err(_) => Ok(Value::Nil),
    }
}

/// `rand(lo, hi)` - a pseudo-random integer in `[lo, hi)`.
pub fn rand_native(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let (Some(lo), Some(hi)) = (args[0].as_number(), args[1].as_number()) else {
        return Err("Arguments to 'rand' must be numbers.".to_string());
    };
    let lo = lo.trunc() as i64;
    let hi = hi.trunc() as i64;
    if lo >= hi {
        return Err("Invalid range for 'rand'.".to_string());
    }
    let n = rand::thread_rng().gen_range(lo..hi);
    Ok(Value::Number(n as f64))
}

/// `exit(code)` - terminates the process with the given code.
pub fn exit_native(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let Some(code) = args[0].as_number() else {
        return Err("Argument to 'exit' must be a number.".to_string());
    };
    std::process::exit(code.trunc() as i32);
}
