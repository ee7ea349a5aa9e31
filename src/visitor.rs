use crate::value::{ObjectRef, Value};

/// Receives the object references found while tracing roots, fiber stacks and heap objects.
pub trait VisitorTrait {
    fn visit(&mut self, object: ObjectRef);

    fn visit_value(&mut self, value: &Value) {
        value.each_object(&mut |object| self.visit(object));
    }

    /// Visit every word of a root buffer that encodes an object reference.
    fn visit_words(&mut self, words: &[usize]) {
        for word in words {
            if let Some(object) = ObjectRef::from_word(*word) {
                self.visit(object);
            }
        }
    }
}

/// Collects every reference it is handed. Used to enumerate roots without marking.
#[derive(Default)]
pub struct CollectingVisitor {
    pub found: Vec<ObjectRef>,
}

impl VisitorTrait for CollectingVisitor {
    fn visit(&mut self, object: ObjectRef) {
        self.found.push(object);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_and_words_are_traced() {
        let mut vis = CollectingVisitor::default();
        vis.visit_value(&Value::Array(vec![
            Value::Int(1),
            Value::Object(ObjectRef(3)),
            Value::Array(vec![Value::Object(ObjectRef(4))]),
        ]));
        vis.visit_words(&[0, ObjectRef(5).to_word()]);
        assert_eq!(vis.found, vec![ObjectRef(3), ObjectRef(4), ObjectRef(5)]);
    }
}
