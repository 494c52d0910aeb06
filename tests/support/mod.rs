//! Shared test-source collection for the integration scenarios (spec.md
//! §8). A minimal in-memory `SourceCollection` that stores its rows in a
//! `Vec`, keyed by a caller-named field, and replays pushed
//! `ChangeMessage`s to every subscriber.

use flowquery::driver::{ChangeMessage, SourceCollection, Unsubscribe};
use flowquery::value::{Key, Record, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

pub struct VecSource {
    key_field: String,
    records: RefCell<Vec<Record>>,
    listeners: RefCell<Vec<Rc<dyn Fn(&[ChangeMessage])>>>,
}

impl VecSource {
    pub fn new(key_field: &str, records: Vec<Record>) -> Rc<Self> {
        Rc::new(VecSource {
            key_field: key_field.to_string(),
            records: RefCell::new(records),
            listeners: RefCell::new(Vec::new()),
        })
    }

    pub fn push(&self, message: ChangeMessage) {
        match &message {
            ChangeMessage::Insert(value) => self.records.borrow_mut().push(value.clone()),
            ChangeMessage::Delete(value) => {
                let key = self.get_key(value);
                self.records.borrow_mut().retain(|r| self.get_key(r) != key);
            }
            ChangeMessage::Update(previous, value) => {
                let key = self.get_key(previous);
                let mut records = self.records.borrow_mut();
                if let Some(slot) = records.iter_mut().find(|r| self.get_key(r) == key) {
                    *slot = value.clone();
                } else {
                    records.push(value.clone());
                }
            }
        }
        for listener in self.listeners.borrow().iter() {
            listener(std::slice::from_ref(&message));
        }
    }
}

impl SourceCollection for VecSource {
    fn get_key(&self, record: &Record) -> Key {
        match record.get(&self.key_field) {
            Some(Value::Int(i)) => Key::Int(*i),
            Some(Value::String(s)) => Key::String(s.clone()),
            _ => panic!("record missing key field {:?}", self.key_field),
        }
    }

    fn snapshot(&self) -> Vec<Record> {
        self.records.borrow().clone()
    }

    fn subscribe(&self, listener: Rc<dyn Fn(&[ChangeMessage])>) -> Unsubscribe {
        self.listeners.borrow_mut().push(listener);
        Unsubscribe::new(|| {})
    }
}

pub fn rec(fields: &[(&str, Value)]) -> Record {
    let mut r: Record = HashMap::new();
    for (name, value) in fields {
        r.insert((*name).to_string(), value.clone());
    }
    r
}
