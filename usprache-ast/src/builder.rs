use crate::{
    CoroutineKind, FunctionDecl, InnerReferenceCount, Mutability, Program, StructDecl, TypeDef,
    TypeId, TypeKind, TypeTable,
};

/// Assembles a [`Program`] from declarations handed over by the front end.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    types: TypeTable,
    functions: Vec<FunctionDecl>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the fundamental type with this name, declaring it on first use.
    pub fn fundamental(&mut self, name: &str) -> TypeId {
        if let Some(id) = self.types.find(name) {
            return id;
        }
        self.types.push(TypeDef {
            name: name.to_string(),
            kind: TypeKind::Fundamental,
        })
    }

    pub fn structure(&mut self, decl: StructDecl) -> TypeId {
        self.types.push(TypeDef {
            name: decl.name.clone(),
            kind: TypeKind::Struct(decl),
        })
    }

    pub fn tuple(&mut self, elements: Vec<TypeId>) -> TypeId {
        let names: Vec<&str> = elements.iter().map(|e| self.types.name(*e)).collect();
        let name = format!("tup[{}]", names.join(", "));
        self.types.push(TypeDef {
            name,
            kind: TypeKind::Tuple(elements),
        })
    }

    pub fn array(&mut self, element: TypeId, len: u64) -> TypeId {
        let name = format!("[{}, {}]", self.types.name(element), len);
        self.types.push(TypeDef {
            name,
            kind: TypeKind::Array { element, len },
        })
    }

    pub fn dependent(&mut self, name: &str, count: InnerReferenceCount) -> TypeId {
        self.types.push(TypeDef {
            name: name.to_string(),
            kind: TypeKind::Dependent(count),
        })
    }

    pub fn coroutine(
        &mut self,
        name: &str,
        kind: CoroutineKind,
        inner_references: Vec<Mutability>,
    ) -> TypeId {
        self.types.push(TypeDef {
            name: name.to_string(),
            kind: TypeKind::Coroutine {
                kind,
                inner_references,
            },
        })
    }

    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    pub fn function(&mut self, function: FunctionDecl) -> &mut Self {
        self.functions.push(function);
        self
    }

    pub fn build(self) -> Program {
        Program {
            types: self.types,
            functions: self.functions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FieldDecl;

    #[test]
    fn test_fundamental_types_are_interned() {
        let mut b = ProgramBuilder::new();
        let a = b.fundamental("i32");
        let c = b.fundamental("i32");
        assert_eq!(a, c);
        assert_eq!(b.types().len(), 1);
    }

    #[test]
    fn test_struct_lookup() {
        let mut b = ProgramBuilder::new();
        let i32_ty = b.fundamental("i32");
        let s = b.structure(StructDecl::new(
            "S",
            vec![FieldDecl::reference("x", i32_ty, Mutability::Imut)],
        ));
        let program = b.build();
        let decl = program.types.struct_decl(s).unwrap();
        assert_eq!(decl.fields[0].name, "x");
        assert_eq!(program.types.name(s), "S");
    }

    #[test]
    fn test_tuple_name_lists_elements() {
        let mut b = ProgramBuilder::new();
        let i32_ty = b.fundamental("i32");
        let f32_ty = b.fundamental("f32");
        let t = b.tuple(vec![i32_ty, f32_ty]);
        assert_eq!(b.types().name(t), "tup[i32, f32]");
    }
}
