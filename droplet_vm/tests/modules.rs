//! Import resolution through the whole pipeline: modules on disk are
//! loaded, type-checked once, compiled ahead of the main program, and
//! callable at runtime.

use droplet_compiler::codegen::CodeGenerator;
use droplet_compiler::{ModuleLoader, TypeChecker};
use droplet_vm::{loader, Vm};
use std::path::PathBuf;

fn unique_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "droplet_modules_{tag}_{}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create module dir");
    dir
}

fn run_with_modules(root: &PathBuf, source: &str) -> String {
    let program = droplet_parser::parse(source).expect("parse main");

    let mut module_loader = ModuleLoader::new();
    module_loader.add_search_path(root);

    let info = TypeChecker::check(&program, Some(&mut module_loader)).expect("check");
    let generator = CodeGenerator::new(&info);
    let (mut builder, _) = generator
        .generate_with_modules(&program, &module_loader)
        .expect("generate");

    let mut vm = Vm::new();
    vm.capture_output();
    loader::load_bytes(&mut vm, &builder.to_bytes()).expect("load");
    vm.run_program().expect("run");
    vm.take_output()
}

#[test]
fn test_named_import_of_function() {
    let root = unique_dir("named");
    std::fs::create_dir_all(root.join("util")).expect("mkdir");
    std::fs::write(
        root.join("util/math.drop"),
        "fn double(x:int) -> int { return x + x }\nfn triple(x:int) -> int { return x + x + x }",
    )
    .expect("write module");

    let out = run_with_modules(
        &root,
        "import util.math { double }\nfn main(){ println(double(21)) }",
    );
    assert_eq!(out, "42\n");
}

#[test]
fn test_wildcard_import() {
    let root = unique_dir("wildcard");
    std::fs::create_dir_all(root.join("util")).expect("mkdir");
    std::fs::write(
        root.join("util/math.drop"),
        "fn double(x:int) -> int { return x + x }\nfn triple(x:int) -> int { return x + x + x }",
    )
    .expect("write module");

    let out = run_with_modules(
        &root,
        "use util.math\nfn main(){ println(double(2) + triple(2)) }",
    );
    assert_eq!(out, "10\n");
}

#[test]
fn test_imported_class_instantiation() {
    let root = unique_dir("class");
    std::fs::create_dir_all(root.join("shapes")).expect("mkdir");
    std::fs::write(
        root.join("shapes/geom.drop"),
        "class Rect { pub w:int=0 pub h:int=0
  new(w:int,h:int){ }
  pub fn area()->int { return self.w * self.h } }",
    )
    .expect("write module");

    let out = run_with_modules(
        &root,
        "import shapes.geom { Rect }\nfn main(){ let r = new Rect(6, 7); println(r.area()) }",
    );
    assert_eq!(out, "42\n");
}

#[test]
fn test_transitive_imports() {
    let root = unique_dir("transitive");
    std::fs::create_dir_all(root.join("a")).expect("mkdir");
    std::fs::create_dir_all(root.join("b")).expect("mkdir");
    std::fs::write(
        root.join("b/base.drop"),
        "fn base_value() -> int { return 40 }",
    )
    .expect("write base");
    std::fs::write(
        root.join("a/mid.drop"),
        "import b.base { base_value }\nfn mid_value() -> int { return base_value() + 2 }",
    )
    .expect("write mid");

    let out = run_with_modules(
        &root,
        "import a.mid { mid_value }\nfn main(){ println(mid_value()) }",
    );
    assert_eq!(out, "42\n");
}

#[test]
fn test_missing_symbol_is_type_error() {
    let root = unique_dir("missing");
    std::fs::create_dir_all(root.join("util")).expect("mkdir");
    std::fs::write(root.join("util/m.drop"), "fn f() -> int { return 1 }").expect("write");

    let program =
        droplet_parser::parse("import util.m { nope }\nfn main(){ }").expect("parse main");
    let mut module_loader = ModuleLoader::new();
    module_loader.add_search_path(&root);
    let err = TypeChecker::check(&program, Some(&mut module_loader)).unwrap_err();
    assert!(err.to_string().contains("'nope' not found"));
}
