//! The object arena (spec.md §9): every mutable or potentially-cyclic
//! runtime value (lists, maps, instances, function-values, arrays, and
//! closure capture cells) lives here behind an integer [`HeapId`] instead
//! of behind `Rc<RefCell<_>>`. That makes checkpoint serialization of a
//! cyclic object graph a flat array of id-addressed records instead of a
//! pointer-following walk (see `crate::checkpoint`).
//!
//! Grounded on the teacher's arena-style `heap.rs` (slab of slots plus a
//! free list, ids reused on free) adapted to Jactl's smaller closed set of
//! heap object kinds.

use std::collections::HashSet;
use std::fmt::Write as _;

use indexmap::IndexMap;

use crate::intern::Interner;
use crate::runtime::closures::FunctionValue;
use crate::runtime::instance::Instance;
use crate::runtime::value::Value;
use crate::runtime::vm::FunctionTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct HeapId(pub u32);

pub type JMap = IndexMap<String, Value>;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum HeapObject {
    List(Vec<Value>),
    Map(JMap),
    Array(Vec<Value>),
    Instance(Instance),
    FunctionValue(FunctionValue),
    /// A closure capture cell: a single mutable slot shared by every
    /// closure that captured the same variable (spec.md §9).
    Cell(Value),
}

/// Object arena. Slots freed by [`Heap::free`] are recycled via a free
/// list so ids stay dense; nothing currently calls `free` (Jactl has no
/// explicit free operation) but the VM's garbage collector, when one is
/// added, would.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Heap {
    slots: Vec<Option<HeapObject>>,
    free: Vec<u32>,
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, obj: HeapObject) -> HeapId {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(obj);
            HeapId(idx)
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Some(obj));
            HeapId(idx)
        }
    }

    pub fn free(&mut self, id: HeapId) {
        if self.slots[id.0 as usize].take().is_some() {
            self.free.push(id.0);
        }
    }

    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapObject {
        self.slots[id.0 as usize].as_ref().expect("dangling HeapId")
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapObject {
        self.slots[id.0 as usize].as_mut().expect("dangling HeapId")
    }

    /// Renders a value for `toString`/string interpolation, detecting
    /// cycles (spec.md §3's `<CIRCULAR_REF>` note) rather than recursing
    /// forever on a list or map that contains itself.
    #[must_use]
    pub fn display(&self, value: &Value) -> String {
        let mut out = String::new();
        let mut visiting = HashSet::new();
        self.write_display(value, &mut out, &mut visiting);
        out
    }

    fn write_display(&self, value: &Value, out: &mut String, visiting: &mut HashSet<HeapId>) {
        match value {
            Value::Null => out.push_str("null"),
            Value::Bool(b) => write!(out, "{b}").unwrap(),
            Value::Byte(b) => write!(out, "{b}").unwrap(),
            Value::Int(i) => write!(out, "{i}").unwrap(),
            Value::Long(l) => write!(out, "{l}").unwrap(),
            Value::Double(d) => write!(out, "{d}").unwrap(),
            Value::Decimal(d) => write!(out, "{d}").unwrap(),
            Value::Str(s) => out.push_str(s),
            Value::Ref(id) => {
                if !visiting.insert(*id) {
                    out.push_str("<CIRCULAR_REF>");
                    return;
                }
                match self.get(*id) {
                    HeapObject::List(items) | HeapObject::Array(items) => {
                        out.push('[');
                        for (i, item) in items.iter().enumerate() {
                            if i > 0 {
                                out.push_str(", ");
                            }
                            self.write_display(item, out, visiting);
                        }
                        out.push(']');
                    }
                    HeapObject::Map(map) => {
                        out.push('[');
                        if map.is_empty() {
                            out.push(':');
                        }
                        for (i, (k, v)) in map.iter().enumerate() {
                            if i > 0 {
                                out.push_str(", ");
                            }
                            write!(out, "{k}:").unwrap();
                            self.write_display(v, out, visiting);
                        }
                        out.push(']');
                    }
                    HeapObject::Instance(inst) => {
                        out.push_str(&inst.class_name);
                        out.push('@');
                        write!(out, "{}", id.0).unwrap();
                    }
                    HeapObject::FunctionValue(f) => {
                        write!(out, "Function@{}", f.fn_id).unwrap();
                    }
                    HeapObject::Cell(v) => self.write_display(&v.clone(), out, visiting),
                }
                visiting.remove(id);
            }
        }
    }

    /// Deep structural equality (spec.md §3/§8's `==`), with cycle
    /// detection so `a.x = a` never makes `==` loop forever: a pair of
    /// ids revisited while already comparing is treated as equal (the
    /// cycle "closes" consistently on both sides, or the comparison would
    /// already have failed on the acyclic prefix). An instance and a map
    /// compare equal when the map has exactly the instance's field names,
    /// each with an equal value (spec.md §3), so `==` stays symmetric
    /// regardless of which side is the instance.
    #[must_use]
    pub fn structural_eq(&self, a: &Value, b: &Value, functions: &FunctionTable, interner: &Interner) -> bool {
        let mut visiting = HashSet::new();
        self.eq_inner(a, b, functions, interner, &mut visiting)
    }

    fn eq_inner(&self, a: &Value, b: &Value, functions: &FunctionTable, interner: &Interner, visiting: &mut HashSet<(HeapId, HeapId)>) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Str(x), Value::Str(y)) => x == y,
            (Value::Decimal(x), Value::Decimal(y)) => x.cmp(y) == std::cmp::Ordering::Equal,
            _ if a.as_f64().is_some() && b.as_f64().is_some() => {
                if matches!(a, Value::Decimal(_)) || matches!(b, Value::Decimal(_)) {
                    return false;
                }
                a.as_f64() == b.as_f64()
            }
            (Value::Ref(x), Value::Ref(y)) => {
                if x == y {
                    return true;
                }
                if !visiting.insert((*x, *y)) {
                    return true;
                }
                let result = match (self.get(*x), self.get(*y)) {
                    (HeapObject::List(xs), HeapObject::List(ys)) | (HeapObject::Array(xs), HeapObject::Array(ys)) => {
                        xs.len() == ys.len() && xs.iter().zip(ys).all(|(p, q)| self.eq_inner(p, q, functions, interner, visiting))
                    }
                    (HeapObject::Map(xm), HeapObject::Map(ym)) => {
                        xm.len() == ym.len()
                            && xm.iter().all(|(k, v)| ym.get(k).is_some_and(|w| self.eq_inner(v, w, functions, interner, visiting)))
                    }
                    (HeapObject::Instance(xi), HeapObject::Instance(yi)) => {
                        xi.class_name == yi.class_name
                            && xi.fields.len() == yi.fields.len()
                            && xi.fields.iter().zip(&yi.fields).all(|(p, q)| self.eq_inner(p, q, functions, interner, visiting))
                    }
                    (HeapObject::Instance(inst), HeapObject::Map(map)) | (HeapObject::Map(map), HeapObject::Instance(inst)) => {
                        self.instance_map_eq(inst, map, functions, interner, visiting)
                    }
                    _ => false,
                };
                visiting.remove(&(*x, *y));
                result
            }
            _ => false,
        }
    }

    fn instance_map_eq(
        &self,
        inst: &Instance,
        map: &JMap,
        functions: &FunctionTable,
        interner: &Interner,
        visiting: &mut HashSet<(HeapId, HeapId)>,
    ) -> bool {
        let fields = functions.field_names(&inst.class_name, interner);
        fields.len() == map.len()
            && fields.iter().all(|(index, name)| {
                map.get(name).is_some_and(|v| self.eq_inner(inst.field(*index), v, functions, interner, visiting))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::instance::Instance;

    #[test]
    fn lists_with_equal_elements_are_equal() {
        let mut heap = Heap::new();
        let a = heap.alloc(HeapObject::List(vec![Value::Int(1), Value::Int(2)]));
        let b = heap.alloc(HeapObject::List(vec![Value::Int(1), Value::Int(2)]));
        let functions = FunctionTable::new();
        let interner = Interner::new();
        assert!(heap.structural_eq(&Value::Ref(a), &Value::Ref(b), &functions, &interner));
    }

    #[test]
    fn self_referential_list_displays_without_looping() {
        let mut heap = Heap::new();
        let id = heap.alloc(HeapObject::List(vec![Value::Int(1)]));
        if let HeapObject::List(items) = heap.get_mut(id) {
            items.push(Value::Ref(id));
        }
        assert_eq!(heap.display(&Value::Ref(id)), "[1, <CIRCULAR_REF>]");
    }

    #[test]
    fn instance_and_map_with_same_fields_are_equal_both_ways() {
        let mut interner = Interner::new();
        let mut functions = FunctionTable::new();
        let x = interner.intern("x");
        let y = interner.intern("y");
        functions.register_field("Point".to_owned(), x, 0);
        functions.register_field("Point".to_owned(), y, 1);

        let mut heap = Heap::new();
        let instance = heap.alloc(HeapObject::Instance(Instance {
            class_name: "Point".to_owned(),
            fields: vec![Value::Int(1), Value::Int(2)],
        }));
        let mut map = JMap::new();
        map.insert("x".to_owned(), Value::Int(1));
        map.insert("y".to_owned(), Value::Int(2));
        let map_id = heap.alloc(HeapObject::Map(map));

        assert!(heap.structural_eq(&Value::Ref(instance), &Value::Ref(map_id), &functions, &interner));
        assert!(heap.structural_eq(&Value::Ref(map_id), &Value::Ref(instance), &functions, &interner));
    }

    #[test]
    fn instance_and_map_with_different_fields_are_not_equal() {
        let mut interner = Interner::new();
        let mut functions = FunctionTable::new();
        let x = interner.intern("x");
        functions.register_field("Point".to_owned(), x, 0);

        let mut heap = Heap::new();
        let instance = heap.alloc(HeapObject::Instance(Instance { class_name: "Point".to_owned(), fields: vec![Value::Int(1)] }));
        let mut map = JMap::new();
        map.insert("x".to_owned(), Value::Int(2));
        let map_id = heap.alloc(HeapObject::Map(map));

        assert!(!heap.structural_eq(&Value::Ref(instance), &Value::Ref(map_id), &functions, &interner));
    }
}
