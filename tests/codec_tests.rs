// Integration tests for the .ardar module codec: round-trip laws over
// compiler output and malformed-image rejection.

use ardan::codec::{module_from_bytes, module_to_bytes, ArdarReader, ArdarWriter, MAGIC};
use ardan::compile_source;
use ardan::module::Module;

fn compiled(source: &str) -> Module {
    compile_source(source, None).expect("source should compile")
}

#[test]
fn round_trip_preserves_compiler_output() {
    let sources = [
        "let x = 1; print(x);",
        "function add(a, b = 1, ...rest) { return a + b + rest.length; } print(add(1, 2, 3));",
        "class A { var v = 10; getV() { return this.v; } } print(new A().getV());",
        "try { throw \"x\"; } catch (e) { print(e); } finally { print(\"f\"); }",
        "async function g() { return 1; } async function h() { print(await g()); } h();",
        "let o = { a: 1, b: 2 }; for (let k in o) { print(k); }",
    ];
    for source in sources {
        let module = compiled(source);
        let bytes = module_to_bytes(&module).expect("writes");
        let back = module_from_bytes(&bytes).expect("reads");
        assert_eq!(module, back, "round-trip mismatch for: {}", source);
    }
}

#[test]
fn chunk_metadata_survives_the_trip() {
    let module = compiled("function three(a, b, c) { let x = a; let y = b; return x + y + c; }");
    let back = module_from_bytes(&module_to_bytes(&module).expect("writes")).expect("reads");

    let chunk = back
        .chunks
        .iter()
        .find(|chunk| chunk.name == "three")
        .expect("function chunk present");
    assert_eq!(chunk.arity, 3);
    assert!(chunk.max_locals >= 5, "parameters plus two locals");
    assert_eq!(back.version, module.version);
    assert_eq!(back.entry_chunk_index, module.entry_chunk_index);
}

#[test]
fn image_layout_starts_with_magic_and_version() {
    let module = compiled("print(1);");
    let bytes = module_to_bytes(&module).expect("writes");
    assert!(bytes.starts_with(MAGIC));
    let version = u32::from_le_bytes([
        bytes[MAGIC.len()],
        bytes[MAGIC.len() + 1],
        bytes[MAGIC.len() + 2],
        bytes[MAGIC.len() + 3],
    ]);
    assert_eq!(version, module.version);
}

#[test]
fn bad_magic_is_a_hard_error() {
    let module = compiled("print(1);");
    let mut bytes = module_to_bytes(&module).expect("writes");
    bytes[..MAGIC.len()].copy_from_slice(b"NOTARDANXXX");
    assert!(module_from_bytes(&bytes).is_err());
}

#[test]
fn file_writer_and_reader_round_trip() {
    let module = compiled("let tally = 1 + 2; print(tally);");
    let dir = std::env::temp_dir();
    let path = dir.join(format!("ardan-codec-test-{}.ardar", std::process::id()));

    ArdarWriter::create(&path)
        .and_then(|mut writer| writer.write_module(&module))
        .expect("writes to disk");
    let back = ArdarReader::open(&path)
        .and_then(|mut reader| reader.read_module())
        .expect("reads from disk");
    let _ = std::fs::remove_file(&path);

    assert_eq!(module, back);
}
