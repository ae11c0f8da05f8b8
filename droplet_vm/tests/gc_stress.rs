//! GC behavior under allocation pressure, driven through real programs.

use droplet_vm::{loader, Vm};

fn run_in(mut vm: Vm, source: &str) -> (Vm, String) {
    let mut builder = droplet_compiler::compile_source(source).expect("compile failure");
    let bytes = builder.to_bytes();
    vm.capture_output();
    loader::load_bytes(&mut vm, &bytes).expect("load failure");
    vm.run_program().expect("run failure");
    let output = vm.take_output();
    (vm, output)
}

#[test]
fn test_transient_allocations_are_collected() {
    // 10_000 transient strings with no retention beyond the loop body, plus
    // a single retained global array of length 10. After the run the heap
    // must hold the retained roots (and the loaded string constants), not
    // the transients.
    let src = "class Keep { pub static items:list[int] = [0,1,2,3,4,5,6,7,8,9] }
fn main(){
  let i = 0
  while i < 10000 {
    let s = str(i)
    i = i + 1
  }
  println(len(Keep.items))
}";
    let vm = Vm::with_gc_threshold(256);
    let (vm, output) = run_in(vm, src);

    assert_eq!(output, "10\n");

    // Far below 10_000: the transients were swept. The residue is the
    // constant-pool strings, the retained array, and at most one window of
    // uncollected recent allocations.
    let live = vm.allocator.heap().live_count();
    assert!(
        live < 1200,
        "expected transient strings to be collected, live count = {live}"
    );

    // The retained array is intact.
    let keep = vm.globals.get("Keep$$items").expect("retained global");
    let arr = keep.as_object().expect("array object");
    match vm.allocator.heap().get(arr) {
        Some(droplet_vm::HeapObject::Array(items)) => assert_eq!(items.len(), 10),
        other => panic!("expected retained array, got {other:?}"),
    }
}

#[test]
fn test_object_graph_survives_collections() {
    // Build a linked structure while churning garbage; every node must
    // survive because the head stays rooted in a local.
    let src = "class Node { pub value:int=0 pub next:Node = null
  new(v:int){ self.value = v } }
fn main(){
  let head = new Node(0)
  let tail = head
  let i = 1
  while i < 50 {
    let garbage = str(i) + str(i)
    let n = new Node(i)
    tail.next = n
    tail = n
    i = i + 1
  }
  let sum = 0
  let cur = head
  let j = 0
  while j < 50 {
    sum = sum + cur.value
    cur = cur.next as Node
    j = j + 1
  }
  println(sum)
}";
    let vm = Vm::with_gc_threshold(16);
    let (_, output) = run_in(vm, src);
    assert_eq!(output, "1225\n");
}

#[test]
fn test_collections_triggered_by_threshold() {
    let src = "fn main(){
  let i = 0
  while i < 2000 {
    let s = str(i)
    i = i + 1
  }
  println(\"done\")
}";
    let vm = Vm::with_gc_threshold(64);
    let (vm, output) = run_in(vm, src);
    assert_eq!(output, "done\n");
    assert!(
        vm.allocator.heap().live_count() < 2000,
        "threshold-triggered collections should bound the heap"
    );
}
